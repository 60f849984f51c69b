use crate::chat::StreamOptions;
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8088/api";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MODEL: &str = "llama3.1";
pub const DEFAULT_TOP_K: u32 = 5;

pub const ENV_BASE_URL: &str = "PARLEY_BASE_URL";
pub const ENV_TIMEOUT_SECS: &str = "PARLEY_TIMEOUT_SECS";
pub const ENV_MODEL: &str = "PARLEY_MODEL";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub base_url: Url,
    pub request_timeout: Duration,
    pub model: String,
    pub use_knowledge: bool,
    pub top_k: u32,
    pub credentials_path: PathBuf,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration invalid: {0}")]
    Invalid(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Invalid(detail) => format!("{detail}. Update parley.yaml."),
            Self::Read { path, .. } => format!("Could not read {}.", path.display()),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: DEFAULT_TIMEOUT,
            model: DEFAULT_MODEL.to_string(),
            use_knowledge: false,
            top_k: DEFAULT_TOP_K,
            credentials_path: default_credentials_path(),
        }
    }
}

impl ClientSettings {
    /// Reads `parley.yaml` if one exists, then applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut settings = match locate_config_file() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loading client settings");
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: ParleyConfig = serde_yaml::from_str(contents)
            .map_err(|err| ConfigError::Invalid(format!("invalid parley.yaml: {err}")))?;
        let section = file.client.unwrap_or_default();

        let mut settings = Self::default();
        if let Some(base_url) = section.base_url {
            settings.base_url = parse_base_url(&base_url)?;
        }
        if let Some(secs) = section.timeout_secs {
            settings.request_timeout = timeout_from_secs(secs)?;
        }
        if let Some(model) = section.model.filter(|model| !model.trim().is_empty()) {
            settings.model = model.trim().to_string();
        }
        if let Some(use_knowledge) = section.use_knowledge {
            settings.use_knowledge = use_knowledge;
        }
        if let Some(top_k) = section.top_k {
            settings.top_k = top_k;
        }
        if let Some(path) = section.credentials_path {
            settings.credentials_path = path;
        }
        Ok(settings)
    }

    /// Overrides fields from `lookup`, normally the process environment.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_BASE_URL) {
            self.base_url = parse_base_url(&value)?;
        }
        if let Some(value) = lookup(ENV_TIMEOUT_SECS) {
            let secs = value.trim().parse::<u64>().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_TIMEOUT_SECS} must be whole seconds"))
            })?;
            self.request_timeout = timeout_from_secs(secs)?;
        }
        if let Some(value) = lookup(ENV_MODEL).filter(|value| !value.trim().is_empty()) {
            self.model = value.trim().to_string();
        }
        Ok(())
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            model: self.model.clone(),
            use_knowledge: self.use_knowledge,
            top_k: self.top_k,
        }
    }
}

fn default_base_url() -> Url {
    Url::parse(DEFAULT_BASE_URL).expect("built-in base url parses")
}

fn parse_base_url(value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim())
        .map_err(|err| ConfigError::Invalid(format!("invalid base url `{value}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "base url `{value}` must use http or https"
        )));
    }
    Ok(url)
}

fn timeout_from_secs(secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid(
            "request timeout must be at least one second".to_string(),
        ));
    }
    Ok(Duration::from_secs(secs))
}

pub fn default_credentials_path() -> PathBuf {
    match BaseDirs::new() {
        Some(base) => base.config_dir().join("parley").join("credentials.json"),
        None => PathBuf::from(".parley").join("credentials.json"),
    }
}

fn locate_config_file() -> Option<PathBuf> {
    config_candidates().into_iter().find(|path| path.exists())
}

fn config_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("parley");
        paths.push(config_dir.join("parley.yaml"));
        paths.push(config_dir.join("parley.yml"));
        let home_dir = base.home_dir().join(".parley");
        paths.push(home_dir.join("parley.yaml"));
        paths.push(home_dir.join("parley.yml"));
    }
    paths.push(PathBuf::from("parley.yaml"));
    paths.push(PathBuf::from("parley.yml"));
    paths
}

#[derive(Debug, Default, Deserialize)]
struct ParleyConfig {
    client: Option<ClientSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClientSection {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    model: Option<String>,
    use_knowledge: Option<bool>,
    top_k: Option<u32>,
    credentials_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_point_at_local_backend() {
        let settings = ClientSettings::default();
        assert_eq!(settings.base_url.as_str(), "http://localhost:8088/api");
        assert_eq!(settings.request_timeout, Duration::from_secs(300));
        assert_eq!(settings.model, "llama3.1");
        assert_eq!(settings.top_k, 5);
        assert!(!settings.use_knowledge);
        assert!(settings.credentials_path.ends_with("credentials.json"));
    }

    #[test]
    fn reads_client_section() {
        let yaml = r#"
client:
  base_url: https://chat.example.com/api
  timeout_secs: 30
  model: qwen2.5
  use_knowledge: true
  top_k: 8
  credentials_path: /tmp/parley-creds.json
"#;
        let settings = ClientSettings::from_yaml(yaml).expect("settings");
        assert_eq!(settings.base_url.as_str(), "https://chat.example.com/api");
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.model, "qwen2.5");
        assert!(settings.use_knowledge);
        assert_eq!(settings.top_k, 8);
        assert_eq!(
            settings.credentials_path,
            PathBuf::from("/tmp/parley-creds.json")
        );
        assert_eq!(
            settings.stream_options(),
            StreamOptions {
                model: "qwen2.5".into(),
                use_knowledge: true,
                top_k: 8,
            }
        );
    }

    #[test]
    fn empty_or_sectionless_files_mean_defaults() {
        assert_eq!(
            ClientSettings::from_yaml("").expect("empty"),
            ClientSettings::default()
        );
        assert_eq!(
            ClientSettings::from_yaml("other: 1\n").expect("no client section"),
            ClientSettings::default()
        );
    }

    #[test]
    fn rejects_bad_values() {
        let err = ClientSettings::from_yaml("client:\n  base_url: ftp://host/\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = ClientSettings::from_yaml("client:\n  timeout_secs: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = ClientSettings::from_yaml("client:\n  modle: typo\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_BASE_URL, "http://10.0.0.5:9000/api"),
            (ENV_TIMEOUT_SECS, "12"),
            (ENV_MODEL, "  mistral "),
        ]);
        let mut settings = ClientSettings::default();
        settings
            .apply_env(|key| env.get(key).map(|value| value.to_string()))
            .expect("overrides");
        assert_eq!(settings.base_url.as_str(), "http://10.0.0.5:9000/api");
        assert_eq!(settings.request_timeout, Duration::from_secs(12));
        assert_eq!(settings.model, "mistral");

        let err = settings
            .apply_env(|key| (key == ENV_TIMEOUT_SECS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
