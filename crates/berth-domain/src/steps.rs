//! Canonical step names shared between the pipeline catalogs and the
//! reconciliation tables. The paired-operation joins key on specific step
//! names, so these live in one place.

pub const UPDATE_APPS: &str = "Update Apps";
pub const CONFIGURE_DATABASE: &str = "Configure Database";
pub const DISABLE_DEV_WATCHER: &str = "Disable Dev Watcher";
pub const ENABLE_SERVICE_AUTOSTART: &str = "Enable Service Autostart";
pub const SETUP_PRODUCTION: &str = "Setup Production";
pub const CREATE_SITE: &str = "Create Site";
pub const SET_DEVELOPER_MODE: &str = "Set Developer Mode";
pub const RESTART_SERVICES: &str = "Restart Services";
pub const REMOVE_FAIL2BAN: &str = "Remove Fail2Ban";
pub const RUN_INITIAL_SETUP: &str = "Run Initial Setup";

pub const ENABLE_MAINTENANCE_MODE: &str = "Enable Maintenance Mode";
pub const PULL_CHANGES: &str = "Pull Changes";
pub const BUILD_ASSETS: &str = "Build Assets";
pub const MIGRATE_SITE: &str = "Migrate Site";
pub const DISABLE_MAINTENANCE_MODE: &str = "Disable Maintenance Mode";

pub const DOWNLOAD_BACKUP: &str = "Download Backup";
pub const RESTORE_BACKUP: &str = "Restore Backup";
pub const TAKE_BACKUP: &str = "Take Backup";
pub const UPLOAD_OFFSITE: &str = "Upload Offsite";

pub const ADD_SITE_TO_UPSTREAM: &str = "Add Site to Upstream";
pub const REMOVE_SITE_FROM_UPSTREAM: &str = "Remove Site File from Upstream Directory";
pub const RENAME_SITE: &str = "Rename Site";
pub const RENAME_SITE_ON_UPSTREAM: &str = "Rename Site File in Upstream Directory";
pub const ARCHIVE_SITE: &str = "Archive Site";
pub const MOVE_SITE: &str = "Move Site";
pub const RELOAD_UPSTREAM: &str = "Reload Upstream";
