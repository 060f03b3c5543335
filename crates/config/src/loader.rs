//! Finding the config file and the on-disk layout derived from it.

use std::path::{Path, PathBuf};

use {
    anyhow::Context,
    serde::Serialize,
    tracing::{debug, info, warn},
};

use crate::{env_subst::substitute_env, schema::WagateConfig};

const FILE_STEM: &str = "wagate";

/// Accepted extensions, in lookup order.
const EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "json"];

const DEFAULT_HEADER: &str = "# wagate configuration, written on first run.\n\n";

/// Where `wagate.{toml,yaml,yml,json}` is looked up.
#[derive(Debug, Clone, Default)]
pub struct ConfigLocator {
    dir: Option<PathBuf>,
}

impl ConfigLocator {
    /// With `dir`, only that directory is searched. Without it the working
    /// directory comes first, then `~/.config/wagate/`.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        match &self.dir {
            Some(dir) => vec![dir.clone()],
            None => std::iter::once(PathBuf::from("."))
                .chain(user_config_dir())
                .collect(),
        }
    }

    /// The first existing config file.
    pub fn find(&self) -> Option<PathBuf> {
        self.search_dirs()
            .iter()
            .flat_map(|dir| {
                EXTENSIONS
                    .iter()
                    .map(move |ext| dir.join(format!("{FILE_STEM}.{ext}")))
            })
            .find(|path| path.is_file())
    }

    /// The file in use, or where the default one goes.
    pub fn path(&self) -> PathBuf {
        self.find().unwrap_or_else(|| {
            self.dir
                .clone()
                .or_else(user_config_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(format!("{FILE_STEM}.toml"))
        })
    }

    /// Load the config in use. A file that exists but does not parse is an
    /// error. When there is no file, the defaults are written out for
    /// editing and returned.
    pub fn load(&self) -> anyhow::Result<WagateConfig> {
        if let Some(path) = self.find() {
            debug!(path = %path.display(), "loading config");
            return load_config(&path);
        }
        let config = WagateConfig::default();
        let path = self.path();
        match write_default(&path, &config) {
            Ok(()) => info!(path = %path.display(), "wrote default config"),
            Err(e) => warn!(path = %path.display(), error = %e, "cannot write default config"),
        }
        Ok(config)
    }
}

fn user_config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join(FILE_STEM))
}

/// Load one config file; the format follows the extension.
pub fn load_config(path: &Path) -> anyhow::Result<WagateConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse(&substitute_env(&raw), path).with_context(|| format!("invalid config {}", path.display()))
}

fn parse(raw: &str, path: &Path) -> anyhow::Result<WagateConfig> {
    let config = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") | None => toml::from_str(raw)?,
        Some("yaml" | "yml") => serde_yaml::from_str(raw)?,
        Some("json") => serde_json::from_str(raw)?,
        Some(other) => anyhow::bail!("unsupported config format: .{other}"),
    };
    Ok(config)
}

fn write_default(path: &Path, config: &WagateConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config).context("serializing default config")?;
    std::fs::write(path, format!("{DEFAULT_HEADER}{body}"))?;
    Ok(())
}

/// Every on-disk location a gateway uses, resolved from one config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layout {
    pub data_dir: PathBuf,
    pub database_url: String,
    pub queue_dir: PathBuf,
    pub media_dir: PathBuf,
    pub devices_dir: PathBuf,
}

impl Layout {
    /// Rooted at `config.data_dir`, or `~/.wagate` when unset.
    pub fn resolve(config: &WagateConfig) -> Self {
        let data_dir = config
            .data_dir
            .clone()
            .or_else(|| directories::BaseDirs::new().map(|d| d.home_dir().join(".wagate")))
            .unwrap_or_else(|| PathBuf::from(".wagate"));
        Self::under(config, &data_dir)
    }

    /// Rooted at `data_dir`; per-section overrides in `config` still apply.
    pub fn under(config: &WagateConfig, data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            database_url: config.database.resolve_url(data_dir),
            queue_dir: config.queue.resolve_path(data_dir),
            media_dir: config.media.resolve_dir(data_dir),
            devices_dir: config.whatsapp.resolve_devices_dir(data_dir),
        }
    }

    /// Create the directories the stores expect to exist. The queue
    /// directory is created by sled itself.
    pub fn prepare(&self) -> anyhow::Result<()> {
        for dir in [&self.data_dir, &self.media_dir, &self.devices_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("wagate.toml");
        std::fs::write(&toml_path, "[server]\nport = 9100\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().server.port, 9100);

        let yaml_path = dir.path().join("wagate.yaml");
        std::fs::write(&yaml_path, "queue:\n  name: backlog\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().queue.name, "backlog");

        let json_path = dir.path().join("wagate.json");
        std::fs::write(&json_path, r#"{"history":{"poll_interval_ms":250}}"#).unwrap();
        assert_eq!(
            load_config(&json_path).unwrap().history.poll_interval_ms,
            250
        );
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wagate.ini");
        std::fs::write(&path, "port=1").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn first_run_writes_defaults_into_the_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let locator = ConfigLocator::new(Some(dir.path().to_path_buf()));
        assert!(locator.find().is_none());
        assert_eq!(locator.path(), dir.path().join("wagate.toml"));

        let first = locator.load().unwrap();
        assert_eq!(locator.find(), Some(dir.path().join("wagate.toml")));
        assert_eq!(locator.load().unwrap(), first);
    }

    #[test]
    fn toml_wins_over_other_formats_in_the_same_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wagate.json"), r#"{"server":{"port":1}}"#).unwrap();
        std::fs::write(dir.path().join("wagate.toml"), "[server]\nport = 2\n").unwrap();

        let locator = ConfigLocator::new(Some(dir.path().to_path_buf()));
        assert_eq!(locator.load().unwrap().server.port, 2);
    }

    #[test]
    fn broken_file_is_an_error_not_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wagate.toml"), "[server\nport = ").unwrap();

        let err = ConfigLocator::new(Some(dir.path().to_path_buf()))
            .load()
            .unwrap_err();
        assert!(format!("{err:#}").contains("wagate.toml"));
    }

    #[test]
    fn layout_follows_data_dir_and_section_overrides() {
        let config: WagateConfig = toml::from_str(
            r#"
            data_dir = "/srv/wagate"

            [media]
            dir = "/mnt/media"
            "#,
        )
        .unwrap();
        let layout = Layout::resolve(&config);
        assert_eq!(layout.data_dir, PathBuf::from("/srv/wagate"));
        assert_eq!(layout.queue_dir, PathBuf::from("/srv/wagate/queue"));
        assert_eq!(layout.devices_dir, PathBuf::from("/srv/wagate/devices"));
        assert_eq!(layout.media_dir, PathBuf::from("/mnt/media"));
        assert_eq!(
            layout.database_url,
            "sqlite:///srv/wagate/wagate.db?mode=rwc"
        );
    }

    #[test]
    fn prepare_creates_data_media_and_device_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::under(&WagateConfig::default(), &tmp.path().join("state"));
        layout.prepare().unwrap();
        assert!(layout.data_dir.is_dir());
        assert!(layout.media_dir.is_dir());
        assert!(layout.devices_dir.is_dir());
    }
}
