use camino::{Utf8Path, Utf8PathBuf};
use dirs::home_dir;

pub const DEFAULT_STREAMCTL_HOME: &str = ".streamctl";

pub fn default_home_dir() -> Utf8PathBuf {
    home_dir()
        .as_deref()
        .and_then(Utf8Path::from_path)
        .map(|home| home.join(DEFAULT_STREAMCTL_HOME))
        .unwrap_or_default()
}
