//! Environment handling for the container process.
//!
//! Host variables are filtered, `APPTAINERENV_*` overrides are decoded and
//! `--env`/`--env-file` values are injected as overrides. Prefix lists are
//! ordered: the first prefix that provides a key wins.

use std::collections::{BTreeMap, HashMap};

/// Prefixes of runtime variables, primary first.
pub const ENV_PREFIXES: &[&str] = &["APPTAINER_", "SINGULARITY_"];

/// Prefixes of container environment overrides, primary first.
pub const CONTAINER_ENV_PREFIXES: &[&str] = &["APPTAINERENV_", "SINGULARITYENV_"];

const LEGACY_CONTAINER_ENV_PREFIX: &str = "SINGULARITYENV_";

/// Variables forwarded to the container even with `--cleanenv`.
const ALWAYS_PASS_KEYS: &[&str] = &[
    "TERM",
    "http_proxy",
    "HTTP_PROXY",
    "https_proxy",
    "HTTPS_PROXY",
    "no_proxy",
    "NO_PROXY",
    "all_proxy",
    "ALL_PROXY",
    "ftp_proxy",
    "FTP_PROXY",
];

/// Variables never forwarded from the host. The flag tells whether an
/// `APPTAINERENV_` override is permitted.
const ALWAYS_OMIT_KEYS: &[(&str, bool)] = &[
    ("HOME", false),
    ("PATH", false),
    ("APPTAINER_SHELL", false),
    ("APPTAINER_APPNAME", false),
    ("SINGULARITY_SHELL", false),
    ("SINGULARITY_APPNAME", false),
    ("LD_LIBRARY_PATH", true),
];

/// Bash builtin read-only variables an env file can't assign.
pub const READ_ONLY_VARS: &[&str] = &[
    "EUID",
    "PPID",
    "UID",
    "BASHOPTS",
    "BASH_VERSINFO",
    "SHELLOPTS",
];

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("line {line}: {reason}")]
    EnvFileSyntax { line: usize, reason: String },
}

type Result<T> = std::result::Result<T, EnvError>;

/// Ordered process environment, later `set` calls replace earlier values in
/// place.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessEnv {
    entries: Vec<(String, String)>,
}

impl ProcessEnv {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Sets `key` under every runtime prefix, e.g. `APPTAINER_NAME` and
    /// `SINGULARITY_NAME`.
    pub fn set_with_prefixes(&mut self, key: &str, value: &str) {
        for prefix in ENV_PREFIXES {
            self.set(format!("{prefix}{key}"), value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `KEY=VALUE` strings for `process.env`.
    pub fn to_oci(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }
}

/// Splits `KEY=VALUE` strings as found in `std::env::vars()` output.
pub fn split_environ<'a, I>(environ: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = &'a str>,
{
    environ
        .into_iter()
        .filter_map(|e| e.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}

/// Returns the `APPTAINER_*` variables to define from their legacy
/// `SINGULARITY_*` synonyms. A primary variable that is already set is
/// never replaced.
pub fn promote_legacy_vars(host: &[(String, String)]) -> Vec<(String, String)> {
    let present: HashMap<&str, &str> = host.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let mut promoted = Vec::new();
    for (legacy, primary) in [("SINGULARITY_", "APPTAINER_"), ("SINGULARITYENV_", "APPTAINERENV_")] {
        for (key, value) in host {
            let Some(name) = key.strip_prefix(legacy) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let new_key = format!("{primary}{name}");
            match present.get(new_key.as_str()) {
                Some(current) if *current != value => {
                    tracing::warn!("{key} and {new_key} have different values, using the latter");
                }
                Some(_) => {}
                None => {
                    tracing::info!("Environment variable {key} is set, but {new_key} is preferred");
                    promoted.push((new_key, value.clone()));
                }
            }
        }
    }
    promoted
}

fn omit_permission(key: &str) -> Option<bool> {
    ALWAYS_OMIT_KEYS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, permitted)| *permitted)
}

fn must_forward(key: &str, clean_env: bool, no_env: &[String]) -> bool {
    if ALWAYS_PASS_KEYS.contains(&key) {
        return true;
    }
    if omit_permission(key).is_some() || no_env.iter().any(|k| k == key) || clean_env {
        return false;
    }
    true
}

fn set_override(overrides: &mut BTreeMap<String, String>, prefixed: &str, key: &str, value: &str) {
    match overrides.get(key) {
        Some(old) if old != value => tracing::warn!(
            "Skipping environment variable [{prefixed}={value}], {key} is already overridden with different value [{old}]"
        ),
        Some(_) => tracing::debug!(
            "Skipping environment variable [{prefixed}={value}], {key} is already overridden with the same value"
        ),
        None => {
            tracing::info!("Forwarding {prefixed} as {key} environment variable");
            overrides.insert(key.to_string(), value.to_string());
        }
    }
}

fn container_overrides(env: &mut ProcessEnv, host: &[(String, String)]) -> BTreeMap<String, String> {
    let mut overrides = BTreeMap::new();
    for prefix in CONTAINER_ENV_PREFIXES {
        for (name, value) in host {
            let Some(key) = name.strip_prefix(prefix) else {
                continue;
            };
            let target = match key {
                "" => continue,
                "PREPEND_PATH" => "SING_USER_DEFINED_PREPEND_PATH",
                "APPEND_PATH" => "SING_USER_DEFINED_APPEND_PATH",
                "PATH" => "SING_USER_DEFINED_PATH",
                other => {
                    if omit_permission(other) == Some(false) {
                        tracing::warn!("Overriding {other} environment variable with {name} is not permitted");
                        continue;
                    }
                    other
                }
            };
            if !overrides.contains_key(target) {
                env.remove(target);
            }
            set_override(&mut overrides, name, target, value);
        }
    }
    overrides
}

/// Fills `env` from the host environment and returns the override map the
/// action scripts apply inside the container.
pub fn set_container_env(
    env: &mut ProcessEnv,
    host: &[(String, String)],
    no_env: &[String],
    clean_env: bool,
    home_dest: &str,
) -> BTreeMap<String, String> {
    if clean_env {
        env.set("LANG", "C");
    }

    for (key, _) in host {
        if key.starts_with(LEGACY_CONTAINER_ENV_PREFIX) && key.len() > LEGACY_CONTAINER_ENV_PREFIX.len() {
            tracing::debug!("{key} uses the legacy container environment prefix");
        }
    }
    let overrides = container_overrides(env, host);

    for (key, value) in host {
        if ENV_PREFIXES.iter().any(|p| key.starts_with(p)) {
            tracing::debug!("Not forwarding {key} environment variable");
            continue;
        }
        if CONTAINER_ENV_PREFIXES.iter().any(|p| key.starts_with(p)) {
            continue;
        }
        if !must_forward(key, clean_env, no_env) {
            continue;
        }
        match overrides.get(key) {
            Some(existing) => tracing::debug!(
                "Environment variable {key} already has value [{existing}], will not forward [{value}] from parent process environment"
            ),
            None => env.set(key.clone(), value.clone()),
        }
    }

    env.set("HOME", home_dest);
    env.set("PATH", crate::utils::DEFAULT_PATH);
    overrides
}

/// Parses an environment file: `KEY=VALUE` assignments, optional `export`,
/// single quotes kept literal, `$VAR` and `${VAR}` expanded from `context`
/// and from earlier assignments. Commands are never executed.
pub fn parse_env_file(content: &str, context: &[(String, String)]) -> Result<Vec<(String, String)>> {
    let mut scope: HashMap<String, String> = context.iter().cloned().collect();
    let mut assigned: Vec<(String, String)> = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
        let Some((key, rest)) = line.split_once('=') else {
            return Err(EnvError::EnvFileSyntax {
                line: line_no,
                reason: format!("'=' is missing in {line:?}"),
            });
        };
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(EnvError::EnvFileSyntax {
                line: line_no,
                reason: format!("invalid variable name {key:?}"),
            });
        }
        let value = parse_value(rest, &scope).map_err(|reason| EnvError::EnvFileSyntax {
            line: line_no,
            reason,
        })?;
        scope.insert(key.to_string(), value.clone());
        match assigned.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => assigned.push((key.to_string(), value)),
        }
    }
    Ok(assigned)
}

fn parse_value(raw: &str, scope: &HashMap<String, String>) -> std::result::Result<String, String> {
    let mut out = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '\'' {
                        closed = true;
                        break;
                    }
                    out.push(c);
                }
                if !closed {
                    return Err("unterminated single quote".to_string());
                }
            }
            '"' => {
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            if let Some(next) = chars.next() {
                                out.push(next);
                            }
                        }
                        '$' => expand(&mut chars, scope, &mut out)?,
                        c => out.push(c),
                    }
                }
                if !closed {
                    return Err("unterminated double quote".to_string());
                }
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '$' => expand(&mut chars, scope, &mut out)?,
            '#' if out.is_empty() => break,
            c if c.is_whitespace() => {
                if chars.peek() == Some(&'#') {
                    break;
                }
                return Err("unquoted whitespace in value".to_string());
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

fn expand<I>(
    chars: &mut std::iter::Peekable<I>,
    scope: &HashMap<String, String>,
    out: &mut String,
) -> std::result::Result<(), String>
where
    I: Iterator<Item = char>,
{
    let mut name = String::new();
    if chars.peek() == Some(&'{') {
        chars.next();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            name.push(c);
        }
        if !closed {
            return Err("unterminated ${".to_string());
        }
    } else {
        while let Some(&c) = chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            out.push('$');
            return Ok(());
        }
    }
    if name.starts_with('(') {
        return Err("command substitution is not supported".to_string());
    }
    out.push_str(scope.get(&name).map(String::as_str).unwrap_or(""));
    Ok(())
}
