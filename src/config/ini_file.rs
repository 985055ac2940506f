use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use configparser::ini::{Ini, IniDefault};
use tracing::level_filters::LevelFilter;

pub(super) trait ConfigSection {
    type Key;
    type Value;

    fn take_value<T, K: ?Sized>(&mut self, key: &K) -> Result<T>
        where
            String: Borrow<K>,
            T: TryFromConfig<Self::Value>,
            K: Hash + Eq + Display;

    fn take_opt_value<T, K: ?Sized>(&mut self, key: &K) -> Option<T>
        where
            String: Borrow<K>,
            T: TryFromConfig<Self::Value>,
            K: Hash + Eq + Display;

    fn take_multi_value<T, K: ?Sized>(&mut self, key: &K) -> Result<Vec<T>>
        where
            String: Borrow<K>,
            T: TryFromConfig<Self::Value>,
            K: Hash + Eq + Display;
}

impl ConfigSection for HashMap<String, Option<String>> {
    type Key = String;
    type Value = String;

    fn take_value<T, K: ?Sized>(&mut self, key: &K) -> Result<T>
        where
            String: Borrow<K>,
            T: TryFromConfig<Self::Value>,
            K: Hash + Eq + Display
    {
        self.remove(key)
            .flatten()
            .and_then(|v| T::try_from_config(v).ok())
            .ok_or(anyhow!("couldn't take value of key: {}", key))
    }

    fn take_opt_value<T, K: ?Sized>(&mut self, key: &K) -> Option<T>
        where
            String: Borrow<K>,
            T: TryFromConfig<Self::Value>,
            K: Hash + Eq + Display
    {
        self.remove(key)
            .flatten()
            .and_then(|v| T::try_from_config(v).ok())
    }

    fn take_multi_value<T, K: ?Sized>(&mut self, key: &K) -> Result<Vec<T>>
    where
        String: Borrow<K>,
        T: TryFromConfig<Self::Value>,
        K: Hash + Eq + Display
    {
        let val_string_opt = self.remove(key).flatten();
        let mut vec = Vec::new();
        let Some(vals_string) = val_string_opt else {
            return Ok(vec);
        };
        for val_str in vals_string.split_terminator(',') {
            let val = T::try_from_config(val_str.trim().to_owned())?;
            vec.push(val);
        }
        Ok(vec)
    }
}

pub(super) trait HasConfigSection {
    type ConfigSection: ConfigSection;

    fn take_section(&mut self, section_name: &str) -> Option<Self::ConfigSection>;

    fn try_take_section(&mut self, section_name: &str) -> Result<Self::ConfigSection>;
}

impl HasConfigSection for HashMap<String, HashMap<String, Option<String>>> {
    type ConfigSection = HashMap<String, Option<String>>;

    fn take_section(&mut self, section_name: &str) -> Option<Self::ConfigSection> {
        self.remove(section_name)
    }

    fn try_take_section(&mut self, section_name: &str) -> Result<Self::ConfigSection> {
        self.remove(section_name).ok_or(anyhow!("section [{}] not found", section_name))
    }
}

pub(super) trait TryFromConfig<T> where Self: Sized {
    fn try_from_config(value: T) -> Result<Self>;
}

impl TryFromConfig<String> for bool {
    fn try_from_config(value: String) -> Result<Self> {
        Ok(value.parse()?)
    }
}

impl TryFromConfig<String> for usize {
    fn try_from_config(value: String) -> Result<Self> {
        Ok(value.parse()?)
    }
}

impl TryFromConfig<String> for Duration {
    fn try_from_config(value: String) -> Result<Self> {
        Ok(Duration::from_secs(value.parse()?))
    }
}

impl TryFromConfig<String> for PathBuf {
    fn try_from_config(value: String) -> Result<Self> {
        Ok(value.parse()?)
    }
}

impl TryFromConfig<String> for String {
    fn try_from_config(value: String) -> Result<Self> {
        Ok(value)
    }
}

impl TryFromConfig<String> for SocketAddr {
    fn try_from_config(value: String) -> Result<Self> {
        Ok(value.trim().parse()?)
    }
}

impl TryFromConfig<String> for LevelFilter {
    fn try_from_config(value: String) -> Result<Self> {
        Ok(value.parse()?)
    }
}

pub(super) fn get_parser() -> Ini {
    let mut ini_default = IniDefault::default();
    ini_default.default_section = "rusty-duct".to_string();
    ini_default.comment_symbols = vec!['#'];
    ini_default.delimiters = vec!['='];
    Ini::new_from_defaults(ini_default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scalar_values() {
        assert!(bool::try_from_config("true".to_string()).is_ok());
        assert!(SocketAddr::try_from_config("127.0.0.1:4000".to_string()).is_ok());
        assert!(SocketAddr::try_from_config("[::1]:4000".to_string()).is_ok());
        assert!(SocketAddr::try_from_config("four20".to_string()).is_err());
        assert_eq!(
            Duration::try_from_config("5".to_string()).ok(),
            Some(Duration::from_secs(5))
        );
    }
}
