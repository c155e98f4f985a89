use anyhow::Context as _;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Immutable JSON configuration tree with typed, defaulting lookups.
///
/// Sections are addressed with dotted paths ("log.email.alerts"). Lookups
/// never fail: a missing key or a value of the wrong shape yields the
/// supplied default. The store does not validate any schema.
pub struct ConfigStore {
    root: Value,
}

/// Navigates object keys separated by `.` and returns the subtree, if any.
pub(crate) fn lookup_dotted<'a>(root: &'a Value, dotted_path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in dotted_path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

impl ConfigStore {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let root: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                // show the file contents, so the operator can spot the problem
                eprintln!("JSON file:\n{raw}");
                return Err(e)
                    .with_context(|| format!("failed to parse config {}", path.display()));
            }
        };
        Ok(Self { root })
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn get_json(&self, dotted_path: &str) -> Option<&Value> {
        lookup_dotted(&self.root, dotted_path)
    }

    fn get_value(&self, section: &str, key: &str) -> Option<&Value> {
        self.get_json(section).and_then(|s| s.get(key))
    }

    pub fn get_string(&self, section: &str, key: &str, default: &str) -> String {
        match self.get_value(section, key) {
            Some(Value::String(s)) => s.clone(),
            _ => default.to_string(),
        }
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get_value(section, key) {
            Some(Value::Bool(b)) => *b,
            _ => default,
        }
    }

    /// Typed number lookup. Besides native JSON numbers, string values are
    /// accepted: decimal, and `0x`/`0X`-prefixed hex (parsed as a 64-bit
    /// unsigned and narrowed without an overflow check).
    pub fn get_number<T: ConfigNumber>(&self, section: &str, key: &str, default: T) -> T {
        let Some(v) = self.get_value(section, key) else {
            return default;
        };
        if let Some(n) = T::from_json(v) {
            return n;
        }
        if let Some(s) = v.as_str() {
            let t = s.trim();
            if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                if let Ok(raw) = u64::from_str_radix(hex, 16) {
                    return T::from_u64_lossy(raw);
                }
            } else if let Some(n) = T::parse_decimal(t) {
                return n;
            }
        }
        default
    }

    /// Returns the string elements of an array value; anything else yields an
    /// empty vector. Non-string elements are skipped.
    pub fn get_string_vector(&self, section: &str, key: &str) -> Vec<String> {
        match self.get_value(section, key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Enumerates the child keys of the object at `dotted_path`, filtered by
    /// the kind of each child value.
    pub fn get_keys(
        &self,
        dotted_path: &str,
        include_objects: bool,
        include_arrays: bool,
        include_others: bool,
    ) -> Vec<String> {
        let Some(Value::Object(map)) = self.get_json(dotted_path) else {
            return Vec::new();
        };
        map.iter()
            .filter(|(_, v)| match v {
                Value::Object(_) => include_objects,
                Value::Array(_) => include_arrays,
                _ => include_others,
            })
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Numeric types readable through [`ConfigStore::get_number`].
pub trait ConfigNumber: Copy {
    fn from_json(v: &Value) -> Option<Self>;
    fn from_u64_lossy(raw: u64) -> Self;
    fn parse_decimal(s: &str) -> Option<Self>;
}

macro_rules! impl_config_number_int {
    ($($t:ty),*) => {$(
        impl ConfigNumber for $t {
            fn from_json(v: &Value) -> Option<Self> {
                if let Some(i) = v.as_i64() {
                    return <$t>::try_from(i).ok();
                }
                if let Some(u) = v.as_u64() {
                    return <$t>::try_from(u).ok();
                }
                None
            }

            fn from_u64_lossy(raw: u64) -> Self {
                raw as $t
            }

            fn parse_decimal(s: &str) -> Option<Self> {
                s.parse().ok()
            }
        }
    )*};
}

impl_config_number_int!(i8, u8, i16, u16, i32, u32, i64, u64, usize);

impl ConfigNumber for f64 {
    fn from_json(v: &Value) -> Option<Self> {
        v.as_f64()
    }

    fn from_u64_lossy(raw: u64) -> Self {
        raw as f64
    }

    fn parse_decimal(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ConfigStore {
        ConfigStore::from_value(json!({
            "svcWatchDog": {
                "args": ["/usr/bin/worker", "--loop", 42],
                "usePath": true,
                "restartDelay": 2500,
                "shutdownTime": "0x2710",
                "watchdogTimeout": "1500",
                "workDir": 17
            },
            "log": {
                "minConsoleLevel": 2,
                "email": {
                    "alerts": { "minLogLevel": 4 },
                    "digest": { "minLogLevel": 2 },
                    "recipientsTemplate": ["unused"]
                }
            }
        }))
    }

    #[test]
    fn get_json_navigates_dotted_paths() {
        let cfg = store();
        assert!(cfg.get_json("log.email.alerts").is_some());
        assert!(cfg.get_json("log.email.missing").is_none());
        assert!(cfg.get_json("log.email.alerts.minLogLevel.too.deep").is_none());
    }

    #[test]
    fn get_string_falls_back_on_missing_or_mistyped() {
        let cfg = store();
        assert_eq!(cfg.get_string("svcWatchDog", "missing", "dflt"), "dflt");
        // workDir is a number, not a string
        assert_eq!(cfg.get_string("svcWatchDog", "workDir", "dflt"), "dflt");
        assert_eq!(cfg.get_string("svcWatchDog", "shutdownTime", ""), "0x2710");
    }

    #[test]
    fn get_bool_falls_back_on_missing_or_mistyped() {
        let cfg = store();
        assert!(cfg.get_bool("svcWatchDog", "usePath", false));
        assert!(cfg.get_bool("svcWatchDog", "missing", true));
        assert!(!cfg.get_bool("svcWatchDog", "restartDelay", false));
    }

    #[test]
    fn get_number_reads_native_and_string_values() {
        let cfg = store();
        assert_eq!(cfg.get_number("svcWatchDog", "restartDelay", 0u64), 2500);
        // hex string, parsed as u64 and narrowed
        assert_eq!(cfg.get_number("svcWatchDog", "shutdownTime", 0u64), 10000);
        // decimal string
        assert_eq!(cfg.get_number("svcWatchDog", "watchdogTimeout", -1i64), 1500);
        // missing key
        assert_eq!(cfg.get_number("svcWatchDog", "missing", 7u32), 7);
        // mistyped (array)
        assert_eq!(cfg.get_number("svcWatchDog", "args", 7u32), 7);
    }

    #[test]
    fn get_number_narrows_hex_without_overflow_check() {
        let cfg = ConfigStore::from_value(json!({ "s": { "v": "0x1FF" } }));
        assert_eq!(cfg.get_number("s", "v", 0u8), 0xFFu8);
        assert_eq!(cfg.get_number("s", "v", 0u16), 0x1FFu16);
    }

    #[test]
    fn get_string_vector_skips_non_strings() {
        let cfg = store();
        assert_eq!(
            cfg.get_string_vector("svcWatchDog", "args"),
            vec!["/usr/bin/worker".to_string(), "--loop".to_string()]
        );
        assert!(cfg.get_string_vector("svcWatchDog", "missing").is_empty());
        assert!(cfg.get_string_vector("svcWatchDog", "usePath").is_empty());
    }

    #[test]
    fn get_keys_filters_by_value_kind() {
        let cfg = store();
        let mut objects = cfg.get_keys("log.email", true, false, false);
        objects.sort();
        assert_eq!(objects, vec!["alerts".to_string(), "digest".to_string()]);
        let arrays = cfg.get_keys("log.email", false, true, false);
        assert_eq!(arrays, vec!["recipientsTemplate".to_string()]);
        assert!(cfg.get_keys("log.missing", true, true, true).is_empty());
    }
}
