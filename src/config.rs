//! JSON configuration file, loaded from `$THESEUSHOME` (falling back to
//! `~/.theseus/`), self-healing on a malformed file (§5, ambient
//! config-loading stack). Grounded directly on
//! `original_source/theseus/config.py`'s `Config`: same defaults, same
//! deep-merge-over-defaults semantics, same rewrite-on-every-mutation
//! behavior.

use log::{info, warn};
use serde_json::{json, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// The exact well-known-port avoid-list from the original, carried over
/// verbatim -- this isn't something to second-guess or trim, just data.
const PORTS_TO_AVOID: &[u16] = &[
    1080, 1093, 1094, 1099, 1109, 1127, 1178, 1194, 1210, 1214, 1236, 1241, 1300, 1313, 1314, 1352,
    1433, 1434, 1524, 1525, 1529, 1645, 1646, 1649, 1677, 1701, 1812, 1813, 1863, 1957, 1958, 1959,
    2000, 2003, 2010, 2049, 2053, 2086, 2101, 2102, 2103, 2104, 2105, 2111, 2119, 2121, 2135, 2150,
    2401, 2430, 2431, 2432, 2433, 2583, 2600, 2601, 2602, 2603, 2604, 2605, 2606, 2607, 2608, 2628,
    2792, 2811, 2947, 2988, 2989, 3050, 3130, 3260, 3306, 3493, 3632, 3689, 3690, 4031, 4094, 4190,
    4224, 4353, 4369, 4373, 4500, 4557, 4559, 4569, 4600, 4691, 4899, 4949, 5002, 5050, 5051, 5052,
    5060, 5061, 5151, 5190, 5222, 5269, 5308, 5353, 5354, 5355, 5432, 5555, 5556, 5666, 5667, 5671,
    5672, 5674, 5675, 5680, 5688, 6000, 6001, 6002, 6003, 6004, 6005, 6006, 6007, 6346, 6347, 6444,
    6445, 6446, 6514, 6566, 6667, 7001, 7002, 7003, 7004, 7005, 7006, 7007, 7008, 7009, 7100, 8021,
    8080, 8081, 8088, 9098, 9101, 9102, 9103, 9359, 9418, 9667, 9673, 10000, 10050, 10051, 10080,
    10081, 10082, 10083, 10809, 11112, 11201, 11371, 13720, 13721, 13722, 13724, 13782, 13783,
    15345, 17001, 17002, 17003, 17004, 17500, 20011, 20012, 22125, 22128, 22273, 24554, 27374,
    30865, 57000, 60177, 60179,
];

fn defaults() -> Value {
    json!({
        "config_version": "1",
        "protocol_version": "0",
        "listen_port_range": [1337, 42000],
        "ports_to_avoid": PORTS_TO_AVOID,
    })
}

fn theseus_dir() -> PathBuf {
    match env::var_os("THESEUSHOME") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".theseus"),
    }
}

/// Deep-merges `overlay` over `base`: nested objects merge key-by-key,
/// anything else in `overlay` replaces `base` outright. Mirrors
/// `Config.dict_merge` exactly (including that neither input is mutated).
fn dict_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                let next = match merged.get(k) {
                    Some(existing) if existing.is_object() && v.is_object() => dict_merge(existing, v),
                    _ => v.clone(),
                };
                merged.insert(k.clone(), next);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

/// Loaded, deep-merged-over-defaults configuration. Every mutation
/// through [`Config::set`] is immediately rewritten to disk, matching the
/// original's `__setitem__`.
pub struct Config {
    path: PathBuf,
    data: Value,
}

impl Config {
    /// Loads (or creates) the config file under `$THESEUSHOME`. A present
    /// but unparseable file self-heals to the compiled-in defaults rather
    /// than failing startup, matching the original's bare `except: ...
    /// log.warn(...)` fallback.
    pub fn load() -> Config {
        let dir = theseus_dir();
        let path = dir.join("theseus_config");

        if !dir.is_dir() {
            info!("config dir not found at {:?} -- creating", dir);
            let _ = fs::create_dir_all(&dir);
        }

        let data = if path.exists() {
            info!("loading config file from {:?}", path);
            match fs::read_to_string(&path).ok().and_then(|s| serde_json::from_str::<Value>(&s).ok()) {
                Some(loaded) => dict_merge(&defaults(), &loaded),
                None => {
                    warn!("bad config file at {:?}, falling back to defaults", path);
                    defaults()
                }
            }
        } else {
            info!("config file not found at {:?} -- creating", path);
            defaults()
        };

        let config = Config { path, data };
        config.write();
        config
    }

    fn write(&self) {
        if let Ok(serialized) = serde_json::to_string_pretty(&self.data) {
            let _ = fs::write(&self.path, serialized + "\n");
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Sets `key` to `value` and rewrites the config file immediately.
    pub fn set(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.data {
            map.insert(key.to_string(), value);
        }
        self.write();
    }

    pub fn listen_port_range(&self) -> (u16, u16) {
        self.get("listen_port_range")
            .and_then(|v| v.as_array())
            .and_then(|a| Some((a.get(0)?.as_u64()? as u16, a.get(1)?.as_u64()? as u16)))
            .unwrap_or((1337, 42000))
    }

    pub fn ports_to_avoid(&self) -> Vec<u16> {
        self.get("ports_to_avoid")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|p| p.as_u64().map(|p| p as u16)).collect())
            .unwrap_or_else(|| PORTS_TO_AVOID.to_vec())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_replaces_scalars_and_recurses_into_objects() {
        let base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        let overlay = json!({"a": 2, "nested": {"y": 3}});
        let merged = dict_merge(&base, &overlay);
        assert_eq!(merged, json!({"a": 2, "nested": {"x": 1, "y": 3}}));
    }

    #[test]
    fn ports_to_avoid_is_not_empty() {
        assert!(PORTS_TO_AVOID.len() > 100);
        assert!(PORTS_TO_AVOID.contains(&8080));
    }

    #[test]
    fn default_listen_port_range_matches_original() {
        let defaults = defaults();
        let range = defaults.get("listen_port_range").unwrap().as_array().unwrap();
        assert_eq!(range[0], json!(1337));
        assert_eq!(range[1], json!(42000));
    }
}
