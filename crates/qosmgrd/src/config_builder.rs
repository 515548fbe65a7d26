//! Builds the typed [`QosPlan`] from raw macros
//!
//! Units are dropped at the smallest possible granularity: a malformed
//! optional field falls back to its default, a malformed critical field
//! drops its interface, service or direction spec, and only an empty
//! interface set fails the whole build.

use std::collections::BTreeMap;

use qosmgr_common::{Diagnostics, QosMgrError, QosMgrResult};
use tracing::info;

use crate::macro_reader::RawMacroMap;
use crate::tables::{
    self, defaults, iface_fields, service_fields, IFACE_PREFIX, SERVICE_LIST_MACRO,
};
use crate::types::{
    ClassSpec, Direction, DirectionSpec, InterfaceConfig, InterfaceOverrides, QosPlan, Rate,
    RateOverride, ServiceConfig,
};
use crate::validate::{
    validate_class_id, validate_mark, validate_priority, validate_rate, validate_suffix,
    Criticality, Validated,
};

/// Devices touched by a release pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseTarget {
    pub device: String,
    pub ifb: Option<String>,
}

/// Reads a macro, treating an empty value as absent and logging absence at
/// a severity that follows `criticality`.
fn lookup<'a>(
    raw: &'a RawMacroMap,
    name: &str,
    context: &str,
    criticality: Criticality,
    diag: &mut Diagnostics,
) -> Option<&'a str> {
    match raw.get(name).map(String::as_str).filter(|v| !v.is_empty()) {
        Some(value) => {
            diag.debug(format!("Macro read for {}: {} = '{}'", context, name, value));
            Some(value)
        }
        None => {
            match criticality {
                Criticality::Critical => {
                    diag.error(format!("Required macro missing for {}: {}", context, name))
                }
                Criticality::Optional => {
                    diag.debug(format!("Optional macro not found for {}: {}", context, name))
                }
            }
            None
        }
    }
}

/// Finds `(key, device name)` for every `QOS_IF_<KEY>_NAME` macro.
pub fn discover_interfaces(raw: &RawMacroMap) -> Vec<(String, String)> {
    raw.iter()
        .filter_map(|(name, value)| {
            let key = name
                .strip_prefix(IFACE_PREFIX)?
                .strip_suffix(iface_fields::NAME)?;
            (!key.is_empty()).then(|| (key.to_string(), value.clone()))
        })
        .collect()
}

/// Every discovered interface with its raw IFB value, valid or not.
pub fn release_targets(raw: &RawMacroMap) -> Vec<ReleaseTarget> {
    discover_interfaces(raw)
        .into_iter()
        .filter(|(_, name)| !name.is_empty())
        .map(|(key, name)| ReleaseTarget {
            device: name,
            ifb: raw
                .get(&tables::iface_macro(&key, iface_fields::IFB))
                .filter(|v| !v.is_empty())
                .cloned(),
        })
        .collect()
}

fn build_default_class(
    raw: &RawMacroMap,
    key: &str,
    direction: Direction,
    context: &str,
    diag: &mut Diagnostics,
) -> Option<ClassSpec> {
    let (id_field, prio_field, rate_field, ceil_field) = match direction {
        Direction::Upload => (
            iface_fields::DEFAULT_UPLOAD_ID,
            iface_fields::DEFAULT_UPLOAD_PRIO,
            iface_fields::DEFAULT_UPLOAD_RATE,
            iface_fields::DEFAULT_UPLOAD_CEIL,
        ),
        Direction::Download => (
            iface_fields::DEFAULT_DOWNLOAD_ID,
            iface_fields::DEFAULT_DOWNLOAD_PRIO,
            iface_fields::DEFAULT_DOWNLOAD_RATE,
            iface_fields::DEFAULT_DOWNLOAD_CEIL,
        ),
    };
    let field = |suffix: &str| tables::iface_macro(key, suffix);

    let id = lookup(raw, &field(id_field), context, Criticality::Critical, diag);
    let id = validate_class_id(id, &format!("{} default_{}_id", context, direction), diag);

    let prio = lookup(raw, &field(prio_field), context, Criticality::Optional, diag);
    let priority = validate_priority(
        prio,
        &format!("{} default_{}_priority", context, direction),
        defaults::DEFAULT_CLASS_PRIORITY,
        diag,
    );

    let rate = lookup(raw, &field(rate_field), context, Criticality::Critical, diag);
    let rate = validate_rate(
        rate,
        &format!("{} default_{}_rate", context, direction),
        Criticality::Critical,
        diag,
    );

    let ceil = lookup(raw, &field(ceil_field), context, Criticality::Critical, diag);
    let ceil = validate_rate(
        ceil,
        &format!("{} default_{}_ceil", context, direction),
        Criticality::Critical,
        diag,
    );

    Some(ClassSpec {
        id: id.value()?,
        priority: priority.value()?,
        rate: rate.value()?,
        ceil: ceil.value()?,
    })
}

/// Builds one interface; any missing or malformed critical field drops it.
pub fn build_interface(
    raw: &RawMacroMap,
    key: &str,
    name: &str,
    diag: &mut Diagnostics,
) -> Validated<InterfaceConfig> {
    let context = format!("interface '{}' (macro key {})", name, key);
    diag.debug(format!("Processing {}", context));

    if name.is_empty() {
        let reason = format!("Empty device name for {}. Ignoring this interface", context);
        diag.error(reason.clone());
        return Validated::Rejected { reason };
    }

    let field = |suffix: &str| tables::iface_macro(key, suffix);

    let ifb = lookup(raw, &field(iface_fields::IFB), &context, Criticality::Critical, diag)
        .map(str::to_string);

    let total_upload = lookup(
        raw,
        &field(iface_fields::TOTAL_UPLOAD_BW),
        &context,
        Criticality::Critical,
        diag,
    );
    let total_upload = validate_rate(
        total_upload,
        &format!("{} total_upload_bw", context),
        Criticality::Critical,
        diag,
    );

    let total_download = lookup(
        raw,
        &field(iface_fields::TOTAL_DOWNLOAD_BW),
        &context,
        Criticality::Critical,
        diag,
    );
    let total_download = validate_rate(
        total_download,
        &format!("{} total_download_bw", context),
        Criticality::Critical,
        diag,
    );

    let default_upload = build_default_class(raw, key, Direction::Upload, &context, diag);
    let default_download = build_default_class(raw, key, Direction::Download, &context, diag);

    match (
        ifb,
        total_upload.value(),
        total_download.value(),
        default_upload,
        default_download,
    ) {
        (
            Some(ifb),
            Some(total_upload_bw),
            Some(total_download_bw),
            Some(default_upload_class),
            Some(default_download_class),
        ) => Validated::Valid(InterfaceConfig {
            key: key.to_string(),
            name: name.to_string(),
            ifb: Some(ifb),
            total_upload_bw,
            total_download_bw,
            default_upload_class,
            default_download_class,
        }),
        _ => {
            let reason = format!(
                "Incomplete or invalid base interface configuration for {}. Ignoring this interface",
                context
            );
            diag.error(reason.clone());
            Validated::Rejected { reason }
        }
    }
}

/// Parses `QOS_SERVICE_LIST`, dropping anything after a comment marker.
pub fn service_keys(raw: &RawMacroMap, diag: &mut Diagnostics) -> Vec<String> {
    let Some(list) = raw.get(SERVICE_LIST_MACRO).filter(|v| !v.is_empty()) else {
        diag.warning(format!(
            "Macro {} not found or empty. No specific service will be configured",
            SERVICE_LIST_MACRO
        ));
        return Vec::new();
    };

    let list = list.split('#').next().unwrap_or_default();
    let keys: Vec<String> = list.split_whitespace().map(str::to_string).collect();

    if keys.is_empty() {
        diag.info(format!(
            "No service key left in {} after cleanup",
            SERVICE_LIST_MACRO
        ));
    } else {
        diag.debug(format!("Service keys to process: {:?}", keys));
    }
    keys
}

/// Builds a direction spec; it survives only if suffix, rate and ceil all
/// validate.
fn build_direction_spec(
    raw: &RawMacroMap,
    service_key: &str,
    direction: Direction,
    context: &str,
    diag: &mut Diagnostics,
) -> Validated<DirectionSpec> {
    let (suffix_field, rate_field, ceil_field, fprio_field, fprio_default) = match direction {
        Direction::Upload => (
            service_fields::UPLOAD_SUFFIX,
            service_fields::UPLOAD_RATE_DEFAULT,
            service_fields::UPLOAD_CEIL_DEFAULT,
            service_fields::UPLOAD_FILTER_PRIO_DEFAULT,
            defaults::UPLOAD_FILTER_PRIORITY,
        ),
        Direction::Download => (
            service_fields::DOWNLOAD_SUFFIX,
            service_fields::DOWNLOAD_RATE_DEFAULT,
            service_fields::DOWNLOAD_CEIL_DEFAULT,
            service_fields::DOWNLOAD_FILTER_PRIO_DEFAULT,
            defaults::DOWNLOAD_FILTER_PRIORITY,
        ),
    };
    let field = |name: &str| tables::service_macro(service_key, name);
    let label = |what: &str| format!("{} {}_{}", context, direction, what);

    let suffix = lookup(raw, &field(suffix_field), context, Criticality::Optional, diag);
    let suffix = validate_suffix(suffix, &label("suffix"), diag);

    let rate = lookup(raw, &field(rate_field), context, Criticality::Optional, diag);
    let rate = validate_rate(rate, &label("rate_default"), Criticality::Optional, diag);

    let ceil = lookup(raw, &field(ceil_field), context, Criticality::Optional, diag);
    let ceil = validate_rate(ceil, &label("ceil_default"), Criticality::Optional, diag);

    let fprio = lookup(raw, &field(fprio_field), context, Criticality::Optional, diag);

    let present = [suffix.is_usable(), rate.is_usable(), ceil.is_usable()];
    match (suffix.value(), rate.value(), ceil.value()) {
        (Some(class_id_suffix), Some(rate), Some(ceil)) => {
            let filter_priority =
                validate_priority(fprio, &label("filter_priority"), fprio_default, diag)
                    .value()
                    .unwrap_or(fprio_default);
            Validated::Valid(DirectionSpec {
                class_id_suffix,
                rate,
                ceil,
                filter_priority,
            })
        }
        _ if present.iter().any(|p| *p) => {
            let reason = format!(
                "Incomplete {} spec for {} (suffix, rate and ceil are all required). Dropping it",
                direction, context
            );
            diag.warning(reason.clone());
            Validated::Rejected { reason }
        }
        _ => Validated::Missing,
    }
}

/// Looks up an override macro for each candidate key in order; the first
/// one that validates wins.
fn first_valid_override(
    raw: &RawMacroMap,
    service_key: &str,
    candidates: &[&str],
    direction: Direction,
    field: &str,
    context: &str,
    diag: &mut Diagnostics,
) -> Option<Rate> {
    candidates.iter().find_map(|target| {
        let name = tables::override_macro(service_key, target, direction.macro_token(), field);
        let label = format!(
            "{} override {} {}_{}",
            context,
            target,
            direction,
            field.to_lowercase()
        );
        let value = lookup(raw, &name, &label, Criticality::Optional, diag);
        validate_rate(value, &label, Criticality::Optional, diag).value()
    })
}

/// Resolves the rate/ceil override of one service for one interface and
/// direction.
///
/// Upload overrides are keyed by the interface's discovery key. Download
/// overrides are keyed by the uppercased IFB device name first, falling back
/// to the discovery key per field. An override needs both rate and ceil.
fn resolve_override(
    raw: &RawMacroMap,
    service_key: &str,
    interface: &InterfaceConfig,
    direction: Direction,
    context: &str,
    diag: &mut Diagnostics,
) -> Option<RateOverride> {
    let ifb_key = interface.ifb.as_ref().map(|ifb| ifb.to_uppercase());
    let candidates: Vec<&str> = match direction {
        Direction::Upload => vec![interface.key.as_str()],
        Direction::Download => {
            let ifb_key = ifb_key.as_deref()?;
            vec![ifb_key, interface.key.as_str()]
        }
    };

    let rate = first_valid_override(raw, service_key, &candidates, direction, "RATE", context, diag);
    let ceil = first_valid_override(raw, service_key, &candidates, direction, "CEIL", context, diag);

    match (rate, ceil) {
        (Some(rate), Some(ceil)) => Some(RateOverride { rate, ceil }),
        (None, None) => None,
        _ => {
            diag.warning(format!(
                "Partial {} override for {} on {} (rate and ceil are both required). Ignoring it",
                direction, context, interface.name
            ));
            None
        }
    }
}

/// Builds one service; an invalid mark or the absence of both direction
/// specs drops it.
pub fn build_service(
    raw: &RawMacroMap,
    key: &str,
    interfaces: &[InterfaceConfig],
    diag: &mut Diagnostics,
) -> Validated<ServiceConfig> {
    let context = format!("service '{}'", key);
    let field = |name: &str| tables::service_macro(key, name);

    let mark = lookup(raw, &field(service_fields::MARK), &context, Criticality::Critical, diag);
    let mark = validate_mark(mark, &format!("{} mark", context), diag);
    let prio = lookup(raw, &field(service_fields::PRIORITY), &context, Criticality::Optional, diag);

    let Some(mark) = mark.value() else {
        let reason = format!("Invalid or missing mark for {}. Ignoring service", context);
        diag.warning(reason.clone());
        return Validated::Rejected { reason };
    };

    let priority = validate_priority(
        prio,
        &format!("{} priority", context),
        defaults::SERVICE_PRIORITY,
        diag,
    )
    .value()
    .unwrap_or(defaults::SERVICE_PRIORITY);

    let upload = build_direction_spec(raw, key, Direction::Upload, &context, diag).value();
    let download = build_direction_spec(raw, key, Direction::Download, &context, diag).value();

    if upload.is_none() && download.is_none() {
        let reason = format!(
            "Service {} (mark {:#04x}) has no valid upload or download configuration. Ignoring",
            key, mark
        );
        diag.warning(reason.clone());
        return Validated::Rejected { reason };
    }

    let mut overrides: BTreeMap<String, InterfaceOverrides> = BTreeMap::new();
    for interface in interfaces {
        for direction in Direction::ALL {
            let has_base = match direction {
                Direction::Upload => upload.is_some(),
                Direction::Download => download.is_some(),
            };
            if !has_base {
                continue;
            }
            let Some(device) = interface.device(direction) else {
                continue;
            };
            if let Some(ovr) = resolve_override(raw, key, interface, direction, &context, diag) {
                overrides
                    .entry(device.to_string())
                    .or_default()
                    .set(direction, ovr);
            }
        }
    }

    Validated::Valid(ServiceConfig {
        key: key.to_string(),
        mark,
        priority,
        upload,
        download,
        interfaces: overrides,
    })
}

/// Builds the full policy.
///
/// # Errors
///
/// [`QosMgrError::NoUnitsResolved`] if no interface validates.
pub fn build_policy(raw: &RawMacroMap, diag: &mut Diagnostics) -> QosMgrResult<QosPlan> {
    let candidates = discover_interfaces(raw);
    diag.debug(format!(
        "Interface macro keys found: {:?}",
        candidates.iter().map(|(k, _)| k).collect::<Vec<_>>()
    ));

    if candidates.is_empty() {
        diag.error(format!(
            "No interface definition macro (e.g. {}ENP1S0{}) found",
            IFACE_PREFIX,
            iface_fields::NAME
        ));
        return Err(QosMgrError::NoUnitsResolved);
    }

    let mut plan = QosPlan::default();
    for (key, name) in &candidates {
        if let Validated::Valid(interface) = build_interface(raw, key, name, diag) {
            plan.interfaces.push(interface);
        }
    }

    if plan.interfaces.is_empty() {
        diag.error("No WAN interface was configured correctly from the macros");
        return Err(QosMgrError::NoUnitsResolved);
    }

    for key in service_keys(raw, diag) {
        if let Validated::Valid(service) = build_service(raw, &key, &plan.interfaces, diag) {
            plan.services.push(service);
        }
    }

    info!(
        "QoS configuration read from macros: {} interfaces, {} services",
        plan.interfaces.len(),
        plan.services.len()
    );

    Ok(plan)
}
