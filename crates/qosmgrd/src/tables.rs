//! Macro name and traffic control constants for qosmgrd

// Macro families
pub const IFACE_PREFIX: &str = "QOS_IF_";
pub const SERVICE_PREFIX: &str = "QOS_SRV_";
pub const SERVICE_LIST_MACRO: &str = "QOS_SERVICE_LIST";

/// Interface macro suffixes, appended to `QOS_IF_<KEY>`
pub mod iface_fields {
    pub const NAME: &str = "_NAME";
    pub const IFB: &str = "_IFB";
    pub const TOTAL_UPLOAD_BW: &str = "_TOTAL_UPLOAD_BW";
    pub const TOTAL_DOWNLOAD_BW: &str = "_TOTAL_DOWNLOAD_BW";
    pub const DEFAULT_UPLOAD_ID: &str = "_DEFAULT_UPLOAD_ID";
    pub const DEFAULT_UPLOAD_PRIO: &str = "_DEFAULT_UPLOAD_PRIO";
    pub const DEFAULT_UPLOAD_RATE: &str = "_DEFAULT_UPLOAD_RATE";
    pub const DEFAULT_UPLOAD_CEIL: &str = "_DEFAULT_UPLOAD_CEIL";
    pub const DEFAULT_DOWNLOAD_ID: &str = "_DEFAULT_DOWNLOAD_ID";
    pub const DEFAULT_DOWNLOAD_PRIO: &str = "_DEFAULT_DOWNLOAD_PRIO";
    pub const DEFAULT_DOWNLOAD_RATE: &str = "_DEFAULT_DOWNLOAD_RATE";
    pub const DEFAULT_DOWNLOAD_CEIL: &str = "_DEFAULT_DOWNLOAD_CEIL";
}

/// Service macro suffixes, appended to `QOS_SRV_<KEY>_`
pub mod service_fields {
    pub const MARK: &str = "MARK";
    pub const PRIORITY: &str = "PRIORITY";
    pub const UPLOAD_SUFFIX: &str = "UPLOAD_SUFFIX";
    pub const UPLOAD_RATE_DEFAULT: &str = "UPLOAD_RATE_DEFAULT";
    pub const UPLOAD_CEIL_DEFAULT: &str = "UPLOAD_CEIL_DEFAULT";
    pub const UPLOAD_FILTER_PRIO_DEFAULT: &str = "UPLOAD_FILTER_PRIO_DEFAULT";
    pub const DOWNLOAD_SUFFIX: &str = "DOWNLOAD_SUFFIX";
    pub const DOWNLOAD_RATE_DEFAULT: &str = "DOWNLOAD_RATE_DEFAULT";
    pub const DOWNLOAD_CEIL_DEFAULT: &str = "DOWNLOAD_CEIL_DEFAULT";
    pub const DOWNLOAD_FILTER_PRIO_DEFAULT: &str = "DOWNLOAD_FILTER_PRIO_DEFAULT";
    pub const OVERRIDE: &str = "OVERRIDE_";
}

/// Fallback values for non-critical fields
pub mod defaults {
    /// Policy file read when `--config-file` is not given
    pub const CONFIG_PATH: &str = "/etc/foomuuri/foomuuri.conf";

    /// Per-operation timeout in seconds
    pub const COMMAND_TIMEOUT_SECS: u64 = 20;

    /// Priority of interface default classes
    pub const DEFAULT_CLASS_PRIORITY: u8 = 7;

    /// Service class priority
    pub const SERVICE_PRIORITY: u8 = 5;

    /// Upload mark filter priority
    pub const UPLOAD_FILTER_PRIORITY: u8 = 10;

    /// Download mark filter priority
    pub const DOWNLOAD_FILTER_PRIORITY: u8 = 15;

    /// Highest accepted priority value (inclusive)
    pub const MAX_PRIORITY: i64 = 15;
}

/// Traffic control handles and reserved values
pub mod tc {
    /// Root HTB qdisc handle
    pub const ROOT_HANDLE: &str = "1:";

    /// Major number shared by every class under the root
    pub const ROOT_MAJOR: &str = "1";

    /// Minor number of the root-bound class
    pub const ROOT_CLASS_MINOR: &str = "1";

    /// Ingress qdisc handle
    pub const INGRESS_HANDLE: &str = "ffff:";

    /// Priority of the ingress redirect filter
    pub const REDIRECT_FILTER_PRIORITY: u8 = 1;

    /// Sentinel mark routed to the default class
    pub const DEFAULT_MARK: u32 = 0xff;

    /// Mask applied to every mark match
    pub const MARK_MASK: u32 = 0xffff_ffff;

    /// Priority of the catch-all default filter
    pub const DEFAULT_FILTER_PRIORITY: u8 = 20;

    /// Kernel modules loaded before shaping
    pub const KERNEL_MODULES: [&str; 3] = ["ifb", "sch_htb", "act_ctinfo"];
}

/// Builds `QOS_IF_<key><suffix>`
pub fn iface_macro(key: &str, suffix: &str) -> String {
    format!("{}{}{}", IFACE_PREFIX, key, suffix)
}

/// Builds `QOS_SRV_<key>_<field>`
pub fn service_macro(key: &str, field: &str) -> String {
    format!("{}{}_{}", SERVICE_PREFIX, key, field)
}

/// Builds `QOS_SRV_<key>_OVERRIDE_<target>_<direction>_<RATE|CEIL>`
pub fn override_macro(service_key: &str, target: &str, direction: &str, field: &str) -> String {
    format!(
        "{}{}_{}{}_{}_{}",
        SERVICE_PREFIX,
        service_key,
        service_fields::OVERRIDE,
        target,
        direction,
        field
    )
}
