//! Configuration for tether terminal sessions.

/// Main configuration structure.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    /// Environment variables whose sockets are tunneled from the primary
    /// client into the session.
    pub forward: Vec<String>,

    /// Escape character for the attached keyboard, in `^P` notation.
    pub escape: String,

    /// Login shell override. Falls back to the first existing of
    /// /usr/bin/ksh, /bin/ksh, /bin/sh.
    pub shell: Option<String>,

    /// Capacity of each screen repaint buffer, in bytes.
    pub scrollback_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            forward: vec!["SSH_AUTH_SOCK".to_string()],
            escape: "^P".to_string(),
            shell: None,
            scrollback_bytes: 1024 * 1024,
        }
    }
}

/// Returns the config file path: ~/.config/tether/config.toml
#[must_use]
pub fn config_path() -> std::path::PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("~/.config"))
        .join("tether")
        .join("config.toml")
}

/// Load configuration from the default path, falling back to defaults if
/// the file does not exist.
pub fn load() -> eyre::Result<Config> {
    let path = config_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

/// Parse an escape-character description into a byte.
///
/// Accepts the empty string (no escape character, returned as `None`), a
/// single character, or a caret form like `^P` for a control character.
pub fn parse_escape_char(s: &str) -> eyre::Result<Option<u8>> {
    let bytes = s.as_bytes();
    match bytes.len() {
        0 => Ok(None),
        1 => Ok(Some(bytes[0])),
        2 if bytes[0] == b'^' => Ok(Some(bytes[1] & 0x1f)),
        2 if s == "\\0" => Ok(None),
        _ => eyre::bail!("invalid escape character: {s:?}"),
    }
}

/// Render an escape byte the way a user would type it (`^P`, `q`, ...).
#[must_use]
pub fn print_escape_char(c: u8) -> String {
    if c < b' ' {
        format!("^{}", (c + b'@') as char)
    } else if c <= b'~' {
        (c as char).to_string()
    } else {
        format!("\\x{c:02x}")
    }
}
