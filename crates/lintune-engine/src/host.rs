use anyhow::Result;

use crate::HostLayout;

/// Service manager queries and unit control.
pub trait ServiceManager {
    fn is_enabled(&self, unit: &str) -> Result<bool>;
    fn is_active(&self, unit: &str) -> Result<bool>;
    fn enable(&self, units: &[&str]) -> Result<()>;
    fn disable(&self, units: &[&str]) -> Result<()>;
    fn start(&self, unit: &str) -> Result<()>;
    fn stop(&self, unit: &str) -> Result<()>;
    fn restart(&self, unit: &str) -> Result<()>;
    fn daemon_reload(&self) -> Result<()>;
}

/// Distribution package manager. Package names arrive already mapped.
pub trait PackageManager {
    fn is_installed(&self, name: &str) -> Result<bool>;
    fn install(&self, names: &[String], output: &mut dyn FnMut(&str)) -> Result<()>;
    fn remove(&self, names: &[String], output: &mut dyn FnMut(&str)) -> Result<()>;
}

/// Opaque build of the daemon: on success every artifact in the layout
/// exists at its destination.
pub trait DaemonBuilder {
    fn build_and_install(&self, layout: &HostLayout, output: &mut dyn FnMut(&str)) -> Result<()>;
}

/// The daemon's own command line tool.
pub trait DaemonCli {
    /// Raw status line; the engine compares it with the healthy token.
    fn status(&self) -> Result<String>;
    fn version(&self) -> Result<Option<String>>;
    /// Drops the daemon's cached user and group data; returns its message.
    fn clear_cache(&self) -> Result<String>;
    fn recent_journal(&self) -> Result<String>;
}

/// The collaborators the engine drives, injected at construction.
pub struct HostServices {
    pub services: Box<dyn ServiceManager>,
    pub packages: Box<dyn PackageManager>,
    pub builder: Box<dyn DaemonBuilder>,
    pub daemon_cli: Box<dyn DaemonCli>,
}
