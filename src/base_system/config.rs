//! 配置文件读写与带注释生成。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid yaml at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub name: &'static str,
    pub description: &'static str,
}

pub trait ConfigSpec: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;
    fn fields() -> &'static [FieldMeta];
}

/// Load or create a config file, optionally using a base directory.
///
/// - `config_path` given: that exact file is used
/// - otherwise `base_dir/FILE_NAME`, or `./FILE_NAME` without a base
///
/// User values are merged over the defaults; keys missing from the file are
/// written back so the file always documents every option.
pub fn load_or_create_with_base<T: ConfigSpec>(
    config_path: Option<&Path>,
    base_dir: Option<&Path>,
) -> Result<T, ConfigError> {
    let path = resolve_path::<T>(config_path, base_dir);
    ensure_parent(&path)?;

    if !path.exists() {
        let default_config = T::default();
        write_with_comments(&default_config, &path)?;
        return Ok(default_config);
    }

    let user_yaml = read_yaml(&path)?;
    let missing_fields = has_missing_fields::<T>(&user_yaml);

    let mut merged = serde_yaml::to_value(T::default())
        .map_err(|err| ConfigError::Validation(err.to_string()))?;
    merge_values(&mut merged, user_yaml);

    let config: T =
        serde_yaml::from_value(merged).map_err(|err| ConfigError::Validation(err.to_string()))?;

    if missing_fields {
        write_with_comments(&config, &path)?;
    }

    Ok(config)
}

pub fn write_with_comments<T: ConfigSpec>(config: &T, path: &Path) -> Result<(), ConfigError> {
    ensure_parent(path)?;
    let yaml = generate_yaml_with_comments(config)?;
    fs::write(path, yaml).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn generate_yaml_with_comments<T: ConfigSpec>(config: &T) -> Result<String, ConfigError> {
    let Value::Mapping(mapping) =
        serde_yaml::to_value(config).map_err(|err| ConfigError::Validation(err.to_string()))?
    else {
        return Err(ConfigError::Validation(
            "config must serialize to a mapping".to_string(),
        ));
    };

    let mut lines = Vec::new();
    for field in T::fields() {
        if !field.description.is_empty() {
            lines.push(format!("# {}", field.description.replace('\n', "\n# ")));
        }
        let key = Value::String(field.name.to_string());
        let val = mapping.get(&key).cloned().unwrap_or(Value::Null);
        let yaml_line = serde_yaml::to_string(&serde_yaml::Mapping::from_iter([(key, val)]))
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        lines.push(yaml_line.trim_end().to_string());
    }

    Ok(lines.join("\n") + "\n")
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if raw.trim().is_empty() {
        return Ok(Value::Mapping(Default::default()));
    }
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn has_missing_fields<T: ConfigSpec>(user_yaml: &Value) -> bool {
    let Value::Mapping(map) = user_yaml else {
        return true;
    };
    T::fields()
        .iter()
        .any(|field| !map.contains_key(Value::String(field.name.to_string())))
}

fn merge_values(default: &mut Value, user: Value) {
    match (default, user) {
        (Value::Mapping(dest), Value::Mapping(src)) => {
            for (key, user_val) in src {
                if let Some(dest_val) = dest.get_mut(&key) {
                    merge_values(dest_val, user_val);
                } else {
                    dest.insert(key, user_val);
                }
            }
        }
        // null 表示“沿用默认值”
        (_, Value::Null) => {}
        (dest, other) => {
            *dest = other;
        }
    }
}

fn resolve_path<T: ConfigSpec>(path: Option<&Path>, base_dir: Option<&Path>) -> PathBuf {
    match (path, base_dir) {
        (Some(p), _) => p.to_path_buf(),
        (None, Some(base)) => base.join(T::FILE_NAME),
        (None, None) => PathBuf::from(T::FILE_NAME),
    }
}

fn ensure_parent(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}
