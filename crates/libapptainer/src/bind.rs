//! Bind specifications from `--bind`, `--mount` and the admin `bind path`
//! list.

use std::fmt;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindError {
    #[error("wrong bind syntax: {0}")]
    Syntax(String),
    #[error("{option} is not a valid bind option in {spec}")]
    UnknownOption { option: String, spec: String },
    #[error("empty bind source in {0}")]
    EmptySource(String),
    #[error("mount type {0:?} is not supported, only bind mounts are")]
    UnsupportedMountType(String),
    #[error("mount {0} requires a source and a destination")]
    Incomplete(String),
}

type Result<T> = std::result::Result<T, BindError>;

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct BindPath {
    pub source: String,
    pub destination: String,
    pub readonly: bool,
    /// Path inside an image source to bind instead of the image root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_src: Option<String>,
    /// Partition id inside an image source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl BindPath {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    fn options(&self) -> Vec<String> {
        let mut opts = Vec::new();
        if self.readonly {
            opts.push("ro".to_string());
        }
        if let Some(src) = &self.image_src {
            opts.push(format!("image-src={src}"));
        }
        if let Some(id) = &self.id {
            opts.push(format!("id={id}"));
        }
        opts
    }

    fn apply_option(&mut self, opt: &str, spec: &str) -> Result<()> {
        match opt {
            "ro" => self.readonly = true,
            "rw" => self.readonly = false,
            _ => {
                if let Some(v) = opt.strip_prefix("image-src=") {
                    self.image_src = Some(v.to_string());
                } else if let Some(v) = opt.strip_prefix("id=") {
                    self.id = Some(v.to_string());
                } else {
                    return Err(BindError::UnknownOption {
                        option: opt.to_string(),
                        spec: spec.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for BindPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.destination)?;
        let opts = self.options();
        if !opts.is_empty() {
            write!(f, ":{}", opts.join(","))?;
        }
        Ok(())
    }
}

fn is_option(chunk: &str) -> bool {
    matches!(chunk, "ro" | "rw") || chunk.starts_with("image-src=") || chunk.starts_with("id=")
}

fn parse_one(chunk: &str) -> Result<BindPath> {
    let fields: Vec<&str> = chunk.split(':').collect();
    let mut bind = match fields.as_slice() {
        [src] => BindPath::new(*src, *src),
        [src, dst] => BindPath::new(*src, if dst.is_empty() { *src } else { *dst }),
        [src, dst, opt] => {
            let mut bind = BindPath::new(*src, if dst.is_empty() { *src } else { *dst });
            bind.apply_option(opt, chunk)?;
            bind
        }
        _ => return Err(BindError::Syntax(chunk.to_string())),
    };
    if bind.source.is_empty() {
        return Err(BindError::EmptySource(chunk.to_string()));
    }
    bind.source = bind.source.trim().to_string();
    bind.destination = bind.destination.trim().to_string();
    Ok(bind)
}

/// Parses `src[:dst[:opts]]` specs. Each input may hold several specs
/// separated by commas; options following a spec with options attach to it.
pub fn parse_bind_paths<S: AsRef<str>>(paths: &[S]) -> Result<Vec<BindPath>> {
    let mut binds: Vec<BindPath> = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let mut last_had_options = false;
        for chunk in path.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            if last_had_options && !chunk.contains(':') && is_option(chunk) {
                if let Some(last) = binds.last_mut() {
                    last.apply_option(chunk, path)?;
                    continue;
                }
            }
            last_had_options = chunk.matches(':').count() == 2;
            binds.push(parse_one(chunk)?);
        }
    }
    Ok(binds)
}

/// Parses a docker-style `--mount` value such as
/// `type=bind,source=/opt,destination=/mnt,ro`.
pub fn parse_mount_string(spec: &str) -> Result<Vec<BindPath>> {
    let mut bind = BindPath::default();
    let mut kind = None;
    for field in spec.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        let (key, value) = match field.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (field, None),
        };
        match (key, value) {
            ("type", Some(v)) => kind = Some(v.to_string()),
            ("source" | "src", Some(v)) => bind.source = v.to_string(),
            ("destination" | "dst" | "target", Some(v)) => bind.destination = v.to_string(),
            ("ro" | "readonly", None) => bind.readonly = true,
            ("ro" | "readonly", Some(v)) => bind.readonly = v != "false",
            ("image-src", Some(v)) => bind.image_src = Some(v.to_string()),
            ("id", Some(v)) => bind.id = Some(v.to_string()),
            ("bind-propagation", Some(v)) => {
                tracing::debug!("ignoring bind-propagation={v} in mount {spec}")
            }
            _ => {
                return Err(BindError::UnknownOption {
                    option: field.to_string(),
                    spec: spec.to_string(),
                })
            }
        }
    }
    match kind.as_deref() {
        Some("bind") => {}
        Some(other) => return Err(BindError::UnsupportedMountType(other.to_string())),
        None => return Err(BindError::UnsupportedMountType(String::new())),
    }
    if bind.source.is_empty() || bind.destination.is_empty() {
        return Err(BindError::Incomplete(spec.to_string()));
    }
    Ok(vec![bind])
}

/// Value exported as `APPTAINER_BIND` so nested runs see the destinations
/// as sources. Bind options are kept.
pub fn nested_bind_env(binds: &[BindPath]) -> String {
    binds
        .iter()
        .map(|b| {
            let opts = b.options();
            if opts.is_empty() {
                b.destination.clone()
            } else {
                format!("{0}:{0}:{1}", b.destination, opts.join(","))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_parse_bind_paths() -> Result<()> {
        let binds = parse_bind_paths(&["/opt,/data:/mnt:ro", "/scratch:/s"])?;
        assert_eq!(
            binds,
            vec![
                BindPath::new("/opt", "/opt"),
                BindPath {
                    readonly: true,
                    ..BindPath::new("/data", "/mnt")
                },
                BindPath::new("/scratch", "/s"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_trailing_options_attach() -> Result<()> {
        let binds = parse_bind_paths(&["/img.sif:/mnt:image-src=/data,ro,/tmp"])?;
        assert_eq!(binds.len(), 2);
        assert_eq!(binds[0].image_src.as_deref(), Some("/data"));
        assert!(binds[0].readonly);
        assert_eq!(binds[1], BindPath::new("/tmp", "/tmp"));
        Ok(())
    }

    #[test]
    fn test_reserialize_is_stable() -> Result<()> {
        for spec in ["/a:/b", "/a:/b:ro", "/img:/m:image-src=/x", "/c:/c"] {
            let binds = parse_bind_paths(&[spec])?;
            assert_eq!(binds[0].to_string(), spec);
        }
        let once = parse_bind_paths(&["/a"])?[0].to_string();
        assert_eq!(parse_bind_paths(&[once.as_str()])?[0].to_string(), once);
        Ok(())
    }

    #[test]
    fn test_bad_binds() {
        assert!(matches!(
            parse_bind_paths(&["/a:/b:rx"]),
            Err(BindError::UnknownOption { .. })
        ));
        assert!(matches!(
            parse_bind_paths(&["/a:/b:ro:x"]),
            Err(BindError::Syntax(_))
        ));
        assert!(matches!(parse_bind_paths(&[":/b"]), Err(BindError::EmptySource(_))));
    }

    #[test]
    fn test_parse_mount_string() -> Result<()> {
        let binds = parse_mount_string("type=bind,source=/opt,destination=/mnt,ro")?;
        assert_eq!(
            binds,
            vec![BindPath {
                readonly: true,
                ..BindPath::new("/opt", "/mnt")
            }]
        );
        assert_eq!(
            parse_mount_string("type=tmpfs,dst=/x"),
            Err(BindError::UnsupportedMountType("tmpfs".into()))
        );
        assert!(matches!(
            parse_mount_string("type=bind,src=/opt"),
            Err(BindError::Incomplete(_))
        ));
        Ok(())
    }

    #[test]
    fn test_nested_env() -> Result<()> {
        let binds = parse_bind_paths(&["/a:/x,/b"])?;
        assert_eq!(nested_bind_env(&binds), "/x,/b");

        let readonly = parse_bind_paths(&["/data:/mnt:ro,/opt"])?;
        let nested = nested_bind_env(&readonly);
        assert_eq!(nested, "/mnt:/mnt:ro,/opt");
        assert_eq!(
            parse_bind_paths(&[nested.as_str()])?,
            vec![
                BindPath {
                    readonly: true,
                    ..BindPath::new("/mnt", "/mnt")
                },
                BindPath::new("/opt", "/opt"),
            ]
        );
        Ok(())
    }
}
