//! Process configuration: environment variables with an optional `.env` file.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Configuration lookup: an optional `.env` file merged over the process
/// environment, dotenv entries first. Keys on both sides are resolved
/// through the proxy's canonical uppercase knob names, so `port=9000` in
/// `.env` configures `PORT`.
#[derive(Clone, Debug, Default)]
pub struct Env {
    dotenv: BTreeMap<String, String>,
}

impl Env {
    pub fn from_process() -> Self {
        let dotenv = std::fs::read_to_string(".env")
            .map(|contents| parse_dotenv(&contents))
            .unwrap_or_default();
        Self { dotenv }
    }

    pub fn from_dotenv_str(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let key = key.to_ascii_uppercase();
        if let Some(value) = self.dotenv.get(&key) {
            return Some(value.clone());
        }
        std::env::var(&key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

/// Parses `.env` contents into canonical knob entries. Lines that do not
/// look like a knob assignment (comments, missing `=`, keys outside
/// `[A-Za-z0-9_]`, empty values) are ignored rather than rejected, matching
/// the unknown-keys-ignored contract.
pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();

    for raw_line in contents.lines() {
        let Some((raw_key, raw_value)) = raw_line.split_once('=') else {
            continue;
        };

        let key = raw_key.trim();
        let key = key.strip_prefix("export ").map(str::trim).unwrap_or(key);
        if key.is_empty()
            || !key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            continue;
        }

        let value = unquote_value(raw_value.trim());
        if value.is_empty() {
            continue;
        }

        out.insert(key.to_ascii_uppercase(), value.to_string());
    }

    out
}

fn unquote_value(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
        .trim()
}

/// Default rate limits seeded onto newly created users and applied when a
/// user has no limits row at all. `None` means unbounded.
#[derive(Clone, Copy, Debug)]
pub struct DefaultLimits {
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub total_token_limit: Option<u64>,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: Some(60),
            requests_per_day: Some(1000),
            tokens_per_minute: Some(100_000),
            tokens_per_day: Some(1_000_000),
            total_token_limit: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub ollama_base_url: String,
    pub ollama_max_concurrent: usize,
    pub admin_api_key: String,
    pub database_path: PathBuf,
    pub database_pool_size: u32,
    pub max_upload_size_mb: usize,
    pub allowed_image_types: Vec<String>,
    pub default_limits: DefaultLimits,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_max_concurrent: 1,
            admin_api_key: "admin-secret-key".to_string(),
            database_path: PathBuf::from("./db/proxy.db"),
            database_pool_size: 20,
            max_upload_size_mb: 10,
            allowed_image_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/gif".to_string(),
                "image/webp".to_string(),
            ],
            default_limits: DefaultLimits::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(&Env::from_process())
    }

    pub fn from_lookup(env: &Env) -> Self {
        let defaults = Settings::default();
        let default_limits = DefaultLimits {
            requests_per_minute: parse_optional_u64(
                env,
                "DEFAULT_REQUESTS_PER_MINUTE",
                DefaultLimits::default().requests_per_minute,
            ),
            requests_per_day: parse_optional_u64(
                env,
                "DEFAULT_REQUESTS_PER_DAY",
                DefaultLimits::default().requests_per_day,
            ),
            tokens_per_minute: parse_optional_u64(
                env,
                "DEFAULT_TOKENS_PER_MINUTE",
                DefaultLimits::default().tokens_per_minute,
            ),
            tokens_per_day: parse_optional_u64(
                env,
                "DEFAULT_TOKENS_PER_DAY",
                DefaultLimits::default().tokens_per_day,
            ),
            total_token_limit: parse_optional_u64(env, "DEFAULT_TOTAL_TOKEN_LIMIT", None),
        };

        Self {
            host: env.get("HOST").unwrap_or(defaults.host),
            port: parse_number(env, "PORT", defaults.port),
            ollama_base_url: env
                .get("OLLAMA_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.ollama_base_url),
            ollama_max_concurrent: parse_number(
                env,
                "OLLAMA_MAX_CONCURRENT",
                defaults.ollama_max_concurrent,
            )
            .max(1),
            admin_api_key: env.get("ADMIN_API_KEY").unwrap_or(defaults.admin_api_key),
            database_path: env
                .get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            database_pool_size: parse_number(env, "DATABASE_POOL_SIZE", defaults.database_pool_size)
                .max(1),
            max_upload_size_mb: parse_number(env, "MAX_UPLOAD_SIZE_MB", defaults.max_upload_size_mb)
                .max(1),
            allowed_image_types: env
                .get("ALLOWED_IMAGE_TYPES")
                .map(|raw| {
                    raw.split(',')
                        .map(|item| item.trim().to_ascii_lowercase())
                        .filter(|item| !item.is_empty())
                        .collect()
                })
                .filter(|types: &Vec<String>| !types.is_empty())
                .unwrap_or(defaults.allowed_image_types),
            default_limits,
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_size_mb.saturating_mul(1024 * 1024)
    }
}

fn parse_number<T: std::str::FromStr>(env: &Env, key: &str, default: T) -> T {
    env.get(key)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_optional_u64(env: &Env, key: &str, default: Option<u64>) -> Option<u64> {
    match env.get(key) {
        Some(raw) => {
            let raw = raw.trim();
            if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
                None
            } else {
                raw.parse::<u64>().ok().or(default)
            }
        }
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dotenv_skips_comments_and_strips_quotes() {
        let parsed = parse_dotenv(
            "# comment\nexport HOST=example.org\nPORT=\"9000\"\nEMPTY=\nBAD LINE\n",
        );
        assert_eq!(parsed.get("HOST").map(String::as_str), Some("example.org"));
        assert_eq!(parsed.get("PORT").map(String::as_str), Some("9000"));
        assert!(!parsed.contains_key("EMPTY"));
        assert!(!parsed.contains_key("BAD LINE"));
    }

    #[test]
    fn keys_normalize_to_canonical_knob_names() {
        let env = Env::from_dotenv_str("port=9123\nbad key=1\nadmin_api_key='s3cret'\n");
        assert_eq!(env.get("PORT").as_deref(), Some("9123"));
        assert!(env.get("BAD KEY").is_none());

        let settings = Settings::from_lookup(&env);
        assert_eq!(settings.port, 9123);
        assert_eq!(settings.admin_api_key, "s3cret");
    }

    #[test]
    fn settings_fall_back_to_defaults_on_malformed_values() {
        let env = Env::from_dotenv_str("PORT=not-a-port\nOLLAMA_MAX_CONCURRENT=0\n");
        let settings = Settings::from_lookup(&env);
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.ollama_max_concurrent, 1);
    }

    #[test]
    fn settings_read_limits_and_mime_types() {
        let env = Env::from_dotenv_str(
            "DEFAULT_REQUESTS_PER_MINUTE=5\nDEFAULT_TOTAL_TOKEN_LIMIT=1000\nALLOWED_IMAGE_TYPES=image/png, image/webp\n",
        );
        let settings = Settings::from_lookup(&env);
        assert_eq!(settings.default_limits.requests_per_minute, Some(5));
        assert_eq!(settings.default_limits.total_token_limit, Some(1000));
        assert_eq!(
            settings.allowed_image_types,
            vec!["image/png".to_string(), "image/webp".to_string()]
        );
    }

    #[test]
    fn unset_total_token_limit_stays_unbounded() {
        let settings = Settings::from_lookup(&Env::default());
        assert_eq!(settings.default_limits.total_token_limit, None);
    }
}
