//! Settings resolver (C1): three-layer resolution of quota/admission knobs.
//!
//! Priority order per key: persistent override table, process environment
//! variable, compiled-in default. Resolution is lock-free and cheap enough to
//! call on every admission decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    MaxWorkspacesPerUser,
    MaxSandboxesPerWorkspace,
    DefaultCpu,
    DefaultMemory,
    DefaultIdleTimeout,
    WorkspaceMaxTotalCpu,
    WorkspaceMaxTotalMemory,
    WorkspaceDriveSize,
}

impl SettingKey {
    fn env_var(self) -> &'static str {
        match self {
            SettingKey::MaxWorkspacesPerUser => "SANDBOXD_MAX_WORKSPACES_PER_USER",
            SettingKey::MaxSandboxesPerWorkspace => "SANDBOXD_MAX_SANDBOXES_PER_WORKSPACE",
            SettingKey::DefaultCpu => "SANDBOXD_DEFAULT_CPU",
            SettingKey::DefaultMemory => "SANDBOXD_DEFAULT_MEMORY",
            SettingKey::DefaultIdleTimeout => "SANDBOXD_DEFAULT_IDLE_TIMEOUT",
            SettingKey::WorkspaceMaxTotalCpu => "SANDBOXD_WORKSPACE_MAX_TOTAL_CPU",
            SettingKey::WorkspaceMaxTotalMemory => "SANDBOXD_WORKSPACE_MAX_TOTAL_MEMORY",
            SettingKey::WorkspaceDriveSize => "SANDBOXD_WORKSPACE_DRIVE_SIZE",
        }
    }

    fn key_name(self) -> &'static str {
        match self {
            SettingKey::MaxWorkspacesPerUser => "max_workspaces_per_user",
            SettingKey::MaxSandboxesPerWorkspace => "max_sandboxes_per_workspace",
            SettingKey::DefaultCpu => "default_cpu",
            SettingKey::DefaultMemory => "default_memory",
            SettingKey::DefaultIdleTimeout => "default_idle_timeout",
            SettingKey::WorkspaceMaxTotalCpu => "workspace_max_total_cpu",
            SettingKey::WorkspaceMaxTotalMemory => "workspace_max_total_memory",
            SettingKey::WorkspaceDriveSize => "workspace_drive_size",
        }
    }

    /// Compiled-in default, expressed in the same raw units `effective()` returns:
    /// millicores for CPU, bytes for memory, seconds for durations, counts otherwise.
    fn default_value(self) -> u64 {
        match self {
            SettingKey::MaxWorkspacesPerUser => 5,
            SettingKey::MaxSandboxesPerWorkspace => 10,
            SettingKey::DefaultCpu => 1000,
            SettingKey::DefaultMemory => 2 * 1024 * 1024 * 1024,
            SettingKey::DefaultIdleTimeout => 30 * 60,
            SettingKey::WorkspaceMaxTotalCpu => 4000,
            SettingKey::WorkspaceMaxTotalMemory => 8 * 1024 * 1024 * 1024,
            SettingKey::WorkspaceDriveSize => 10 * 1024 * 1024 * 1024,
        }
    }
}

/// Resolved values for every known setting. `0` on any numeric limit means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub max_workspaces_per_user: u64,
    pub max_sandboxes_per_workspace: u64,
    pub default_cpu_millicores: u64,
    pub default_memory_bytes: u64,
    pub default_idle_timeout_seconds: u64,
    pub workspace_max_total_cpu_millicores: u64,
    pub workspace_max_total_memory_bytes: u64,
    pub workspace_drive_size_bytes: u64,
}

/// Scope-parameterized override store: the same shape backs the system-wide
/// override table and the per-user/per-workspace tables from §3.1, so C1
/// resolves all three layers through one code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverrideScope {
    System,
    User(uuid::Uuid),
    Workspace(uuid::Uuid),
}

#[derive(Default)]
struct OverrideTable {
    values: HashMap<(OverrideScope, &'static str), String>,
}

pub struct OverrideStore {
    table: RwLock<OverrideTable>,
}

impl OverrideStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: RwLock::new(OverrideTable::default()),
        })
    }

    pub async fn set(&self, scope: OverrideScope, key: SettingKey, value: String) {
        self.table
            .write()
            .await
            .values
            .insert((scope, key.key_name()), value);
    }

    async fn get(&self, scope: OverrideScope, key: SettingKey) -> Option<String> {
        self.table
            .read()
            .await
            .values
            .get(&(scope, key.key_name()))
            .cloned()
    }
}

pub struct SettingsResolver {
    store: Arc<OverrideStore>,
}

impl SettingsResolver {
    pub fn new(store: Arc<OverrideStore>) -> Self {
        Self { store }
    }

    /// Resolves every known key at system scope.
    pub async fn effective(&self) -> Settings {
        self.effective_for(None, None).await
    }

    /// Resolves `workspace_override ?? user_override ?? system_setting`, falling
    /// back further to environment then compiled-in default for each key.
    pub async fn effective_for(
        &self,
        user_id: Option<uuid::Uuid>,
        workspace_id: Option<uuid::Uuid>,
    ) -> Settings {
        Settings {
            max_workspaces_per_user: self
                .resolve_count(SettingKey::MaxWorkspacesPerUser, user_id, workspace_id)
                .await,
            max_sandboxes_per_workspace: self
                .resolve_count(SettingKey::MaxSandboxesPerWorkspace, user_id, workspace_id)
                .await,
            default_cpu_millicores: self
                .resolve_cpu(SettingKey::DefaultCpu, user_id, workspace_id)
                .await,
            default_memory_bytes: self
                .resolve_memory(SettingKey::DefaultMemory, user_id, workspace_id)
                .await,
            default_idle_timeout_seconds: self
                .resolve_duration(SettingKey::DefaultIdleTimeout, user_id, workspace_id)
                .await,
            workspace_max_total_cpu_millicores: self
                .resolve_cpu(SettingKey::WorkspaceMaxTotalCpu, user_id, workspace_id)
                .await,
            workspace_max_total_memory_bytes: self
                .resolve_memory(SettingKey::WorkspaceMaxTotalMemory, user_id, workspace_id)
                .await,
            workspace_drive_size_bytes: self
                .resolve_memory(SettingKey::WorkspaceDriveSize, user_id, workspace_id)
                .await,
        }
    }

    pub async fn override_setting(&self, scope: OverrideScope, key: SettingKey, value: String) {
        self.store.set(scope, key, value).await;
    }

    async fn resolve_raw(
        &self,
        key: SettingKey,
        user_id: Option<uuid::Uuid>,
        workspace_id: Option<uuid::Uuid>,
    ) -> String {
        if let Some(workspace_id) = workspace_id
            && let Some(value) = self
                .store
                .get(OverrideScope::Workspace(workspace_id), key)
                .await
        {
            return value;
        }
        if let Some(user_id) = user_id
            && let Some(value) = self.store.get(OverrideScope::User(user_id), key).await
        {
            return value;
        }
        if let Some(value) = self.store.get(OverrideScope::System, key).await {
            return value;
        }
        if let Ok(value) = std::env::var(key.env_var()) {
            return value;
        }
        key.default_value().to_string()
    }

    async fn resolve_count(
        &self,
        key: SettingKey,
        user_id: Option<uuid::Uuid>,
        workspace_id: Option<uuid::Uuid>,
    ) -> u64 {
        self.resolve_raw(key, user_id, workspace_id)
            .await
            .parse()
            .unwrap_or_else(|_| key.default_value())
    }

    async fn resolve_cpu(
        &self,
        key: SettingKey,
        user_id: Option<uuid::Uuid>,
        workspace_id: Option<uuid::Uuid>,
    ) -> u64 {
        let raw = self.resolve_raw(key, user_id, workspace_id).await;
        parse_cpu_millicores(&raw).unwrap_or_else(|| key.default_value())
    }

    async fn resolve_memory(
        &self,
        key: SettingKey,
        user_id: Option<uuid::Uuid>,
        workspace_id: Option<uuid::Uuid>,
    ) -> u64 {
        let raw = self.resolve_raw(key, user_id, workspace_id).await;
        parse_memory_bytes(&raw).unwrap_or_else(|| key.default_value())
    }

    async fn resolve_duration(
        &self,
        key: SettingKey,
        user_id: Option<uuid::Uuid>,
        workspace_id: Option<uuid::Uuid>,
    ) -> u64 {
        let raw = self.resolve_raw(key, user_id, workspace_id).await;
        parse_duration_seconds(&raw).unwrap_or_else(|| key.default_value())
    }
}

/// Parses CPU as either a bare integer core count or an `Nm` millicores suffix.
pub fn parse_cpu_millicores(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(millicores) = raw.strip_suffix('m') {
        return millicores.parse().ok();
    }
    raw.parse::<u64>().ok().map(|cores| cores * 1000)
}

/// Parses memory with binary (`Ki|Mi|Gi`) or decimal (`K|M|G`) suffixes, or a
/// bare byte count.
pub fn parse_memory_bytes(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    const BINARY: &[(&str, u64)] = &[("Ki", 1 << 10), ("Mi", 1 << 20), ("Gi", 1 << 30)];
    const DECIMAL: &[(&str, u64)] = &[("K", 1_000), ("M", 1_000_000), ("G", 1_000_000_000)];

    for (suffix, multiplier) in BINARY {
        if let Some(number) = raw.strip_suffix(suffix) {
            return number.trim().parse::<u64>().ok().map(|n| n * multiplier);
        }
    }
    for (suffix, multiplier) in DECIMAL {
        if let Some(number) = raw.strip_suffix(suffix) {
            return number.trim().parse::<u64>().ok().map(|n| n * multiplier);
        }
    }
    raw.parse().ok()
}

/// Parses a human duration (`30m`, `1h`) or a bare second count.
pub fn parse_duration_seconds(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(hours) = raw.strip_suffix('h') {
        return hours.parse::<u64>().ok().map(|h| h * 3600);
    }
    if let Some(minutes) = raw.strip_suffix('m') {
        return minutes.parse::<u64>().ok().map(|m| m * 60);
    }
    if let Some(seconds) = raw.strip_suffix('s') {
        return seconds.parse().ok();
    }
    raw.parse().ok()
}

#[allow(dead_code)]
pub fn duration_from_seconds(seconds: u64) -> Duration {
    Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_millicores_suffix() {
        assert_eq!(parse_cpu_millicores("500m"), Some(500));
        assert_eq!(parse_cpu_millicores("2"), Some(2000));
    }

    #[test]
    fn parses_memory_suffixes() {
        assert_eq!(parse_memory_bytes("1Ki"), Some(1024));
        assert_eq!(parse_memory_bytes("2Mi"), Some(2 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("1G"), Some(1_000_000_000));
        assert_eq!(parse_memory_bytes("100"), Some(100));
    }

    #[test]
    fn parses_human_durations() {
        assert_eq!(parse_duration_seconds("30m"), Some(1800));
        assert_eq!(parse_duration_seconds("1h"), Some(3600));
        assert_eq!(parse_duration_seconds("45s"), Some(45));
    }

    #[tokio::test]
    async fn override_precedence_workspace_beats_user_beats_system() {
        let store = OverrideStore::new();
        let resolver = SettingsResolver::new(store.clone());
        let user_id = uuid::Uuid::new_v4();
        let workspace_id = uuid::Uuid::new_v4();

        store
            .set(OverrideScope::System, SettingKey::MaxSandboxesPerWorkspace, "3".into())
            .await;
        store
            .set(
                OverrideScope::User(user_id),
                SettingKey::MaxSandboxesPerWorkspace,
                "5".into(),
            )
            .await;
        store
            .set(
                OverrideScope::Workspace(workspace_id),
                SettingKey::MaxSandboxesPerWorkspace,
                "8".into(),
            )
            .await;

        let settings = resolver
            .effective_for(Some(user_id), Some(workspace_id))
            .await;
        assert_eq!(settings.max_sandboxes_per_workspace, 8);

        let settings_no_workspace = resolver.effective_for(Some(user_id), None).await;
        assert_eq!(settings_no_workspace.max_sandboxes_per_workspace, 5);
    }

    #[tokio::test]
    async fn zero_means_unlimited_is_just_the_resolved_value() {
        let store = OverrideStore::new();
        let resolver = SettingsResolver::new(store.clone());
        store
            .set(OverrideScope::System, SettingKey::MaxWorkspacesPerUser, "0".into())
            .await;
        let settings = resolver.effective().await;
        assert_eq!(settings.max_workspaces_per_user, 0);
    }
}
