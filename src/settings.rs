use crate::{*, error::*};
use std::{path::PathBuf, str::FromStr, time::Duration};

#[derive(Clone, Debug)]
pub struct Settings {
    // Fill gaps in debug info from precompiled module interfaces (currently only the `std` module).
    // Takes effect for expressions evaluated after the change; already cached types stay cached.
    pub import_std_module: bool,
    // Directories searched for <module>.iface files, in order. The bundled std interface is used if none match.
    pub module_search_path: Vec<PathBuf>,
    pub execute_timeout: Duration, // for running code in the target; we wait this long, then report failure
    pub max_rendered_children: usize, // per value; the rest is reported as truncated
    pub max_render_depth: usize,
}

impl Default for Settings {
    fn default() -> Self { Settings {
        import_std_module: false,
        module_search_path: Vec::new(),
        execute_timeout: Duration::from_millis(500),
        max_rendered_children: 256,
        max_render_depth: 8,
    } }
}

impl Settings {
    // Parses `key = value` lines on top of defaults. '#' starts a comment.
    pub fn parse_config(text: &str) -> Result<Self> {
        let mut s = Settings::default();
        for (line_idx, line) in text.lines().enumerate() {
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => line };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else { return err!(Usage, "line {}: expected 'key = value', got '{}'", line_idx + 1, line) };
            s.set(key.trim(), value.trim()).map_err(|e| error!(Usage, "line {}: {}", line_idx + 1, e))?;
        }
        Ok(s)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "import-std-module" => self.import_std_module = parse_bool(value)?,
            "module-search-path" => self.module_search_path = value.split(':').filter(|p| !p.is_empty()).map(PathBuf::from).collect(),
            "execute-timeout-ms" => self.execute_timeout = Duration::from_millis(u64::from_str(value)?),
            "max-rendered-children" => self.max_rendered_children = usize::from_str(value)?,
            "max-render-depth" => self.max_render_depth = usize::from_str(value)?,
            _ => return err!(Usage, "unknown setting: '{}'", key),
        }
        Ok(())
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => err!(Usage, "expected true or false, got '{}'", s),
    }
}

#[cfg(test)]
mod tests {
    use crate::settings::*;

    #[test]
    fn config_overrides_defaults() {
        let s = Settings::parse_config("# session\nimport-std-module = true\nmodule-search-path = /a:/b/c\nexecute-timeout-ms = 20 # short\n").unwrap();
        assert!(s.import_std_module);
        assert_eq!(s.module_search_path, vec![PathBuf::from("/a"), PathBuf::from("/b/c")]);
        assert_eq!(s.execute_timeout, Duration::from_millis(20));
        assert_eq!(s.max_rendered_children, Settings::default().max_rendered_children);
    }

    #[test]
    fn config_errors() {
        assert!(Settings::parse_config("import-std-module").unwrap_err().is_usage());
        assert!(Settings::parse_config("import-std-module = maybe").unwrap_err().is_usage());
        let e = Settings::parse_config("\nfps = 60").unwrap_err();
        assert!(e.is_usage());
        assert!(e.message.contains("line 2"));
        assert!(!Settings::default().import_std_module);
    }
}
