//! Theme preference persisted next to the history

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::storage::{KeyValueStore, THEME_KEY};

/// Color theme preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    /// Follow the system preference
    #[default]
    Auto,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
            Theme::Auto => "auto",
        }
    }

    /// Resolve `Auto` against the system preference.
    pub fn resolve(self, system_prefers_dark: bool) -> Theme {
        match self {
            Theme::Auto if system_prefers_dark => Theme::Dark,
            Theme::Auto => Theme::Light,
            other => other,
        }
    }
}

impl std::fmt::Display for Theme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            "auto" => Ok(Theme::Auto),
            other => Err(format!(
                "unknown theme '{}', expected light, dark or auto",
                other
            )),
        }
    }
}

/// Reads and writes the theme under [`THEME_KEY`]
pub struct ThemeStore {
    storage: Arc<dyn KeyValueStore>,
}

impl ThemeStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self { storage }
    }

    /// Stored preference, if any. Unreadable or unknown values count as unset.
    pub fn get(&self) -> Option<Theme> {
        match self.storage.get(THEME_KEY) {
            Ok(Some(raw)) => raw.parse().ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read theme preference");
                None
            }
        }
    }

    /// Persist the preference. Returns whether it was saved.
    pub fn set(&self, theme: Theme) -> bool {
        match self.storage.set(THEME_KEY, theme.as_str()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, theme = %theme, "Failed to save theme preference");
                false
            }
        }
    }

    /// Effective theme: stored preference (default `Auto`) resolved against the system.
    pub fn resolve(&self, system_prefers_dark: bool) -> Theme {
        self.get().unwrap_or_default().resolve(system_prefers_dark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_get_set() {
        let themes = ThemeStore::new(Arc::new(MemoryStore::new()));
        assert_eq!(themes.get(), None);
        assert!(themes.set(Theme::Dark));
        assert_eq!(themes.get(), Some(Theme::Dark));
    }

    #[test]
    fn test_invalid_stored_value_ignored() {
        let storage = Arc::new(MemoryStore::new());
        storage.set(THEME_KEY, "sepia").unwrap();
        let themes = ThemeStore::new(storage);
        assert_eq!(themes.get(), None);
        assert_eq!(themes.resolve(true), Theme::Dark);
    }

    #[test]
    fn test_resolve() {
        assert_eq!(Theme::Auto.resolve(false), Theme::Light);
        assert_eq!(Theme::Light.resolve(true), Theme::Light);
        assert_eq!(Theme::Dark.resolve(false), Theme::Dark);
    }

    #[test]
    fn test_set_on_disabled_storage_reports_failure() {
        let themes = ThemeStore::new(Arc::new(MemoryStore::disabled()));
        assert!(!themes.set(Theme::Light));
        assert_eq!(themes.get(), None);
    }
}
