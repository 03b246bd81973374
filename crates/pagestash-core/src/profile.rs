//! Immutable browser launch profiles.
//!
//! A [`BrowserProfile`] describes how a browser instance is launched. Profiles
//! are values: every transform returns a new profile and leaves its input
//! alone, so several derived profiles can share one base.
//!
//! | Mode       | Effect                                                        |
//! |------------|---------------------------------------------------------------|
//! | `default`  | names the profile `default`, restores default capabilities    |
//! | `hidden`   | window is created but never shown                             |
//! | `headless` | no window at all, rendering goes offscreen                    |
//! | `visible`  | window is shown                                               |
//! | `lite`     | images and media are not loaded                               |
//!
//! `default` does not touch visibility, so `hidden` followed by `default`
//! yields a hidden browser with default capabilities:
//!
//! ```rust
//! use pagestash_core::profile::{BrowserProfile, Visibility};
//!
//! let base = BrowserProfile::default();
//! let hidden = BrowserProfile::with_mode(&base, "hidden")?;
//! let capture = BrowserProfile::with_mode(&hidden, "default")?;
//!
//! assert_eq!(base.visibility, Visibility::Visible);
//! assert_eq!(capture.visibility, Visibility::Hidden);
//! assert_eq!(capture.name, "default");
//! assert!(BrowserProfile::with_mode(&base, "bogus").is_err());
//! # Ok::<(), pagestash_core::Error>(())
//! ```

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Modes accepted by [`BrowserProfile::with_mode`].
pub const KNOWN_MODES: &[&str] = &["default", "hidden", "headless", "visible", "lite"];

/// Whether and how the browser window is displayed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// A normal, shown window.
    Visible,
    /// A window that exists but is never shown.
    Hidden,
    /// No window; offscreen rendering.
    Headless,
}

/// Feature switches for a browser instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Capabilities {
    /// Run page scripts.
    pub javascript: bool,
    /// Load images and media.
    pub images: bool,
    /// Render into an offscreen buffer.
    pub offscreen: bool,
    /// Keep cookies and storage between navigations.
    pub persist_session: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            javascript: true,
            images: true,
            offscreen: false,
            persist_session: false,
        }
    }
}

/// Launch configuration for a browser instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BrowserProfile {
    /// Name of the last naming transform (`default` for the base profile).
    pub name: String,
    /// Name of the profile this one was derived from.
    pub base: String,
    /// Transforms applied to reach this profile, in order.
    pub applied_modes: Vec<String>,
    /// Window visibility.
    pub visibility: Visibility,
    /// Feature switches.
    pub capabilities: Capabilities,
    /// Viewport size in CSS pixels.
    pub viewport: (u32, u32),
}

impl Default for BrowserProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base: "default".to_string(),
            applied_modes: Vec::new(),
            visibility: Visibility::Visible,
            capabilities: Capabilities::default(),
            viewport: (1280, 800),
        }
    }
}

impl BrowserProfile {
    /// Derive a new profile from `base` by applying a named mode.
    ///
    /// Fails with [`Error::Configuration`] for unknown mode names; `base` is
    /// never modified.
    pub fn with_mode(base: &Self, mode: &str) -> Result<Self> {
        let mode = mode.trim().to_ascii_lowercase();
        let mut derived = base.clone();
        derived.base.clone_from(&base.name);

        match mode.as_str() {
            "default" => {
                derived.name = "default".to_string();
                derived.capabilities = Capabilities {
                    offscreen: base.capabilities.offscreen,
                    ..Capabilities::default()
                };
            },
            "hidden" => {
                derived.name = "hidden".to_string();
                derived.visibility = Visibility::Hidden;
            },
            "headless" => {
                derived.name = "headless".to_string();
                derived.visibility = Visibility::Headless;
                derived.capabilities.offscreen = true;
            },
            "visible" => {
                derived.name = "visible".to_string();
                derived.visibility = Visibility::Visible;
                derived.capabilities.offscreen = false;
            },
            "lite" => {
                derived.name = "lite".to_string();
                derived.capabilities.images = false;
            },
            other => {
                return Err(Error::Configuration(format!(
                    "unknown browser profile mode '{other}' (expected one of: {})",
                    KNOWN_MODES.join(", ")
                )));
            },
        }

        derived.applied_modes.push(mode);
        Ok(derived)
    }

    /// Apply several modes in order, starting from the default profile.
    pub fn from_modes<S: AsRef<str>>(modes: &[S]) -> Result<Self> {
        modes
            .iter()
            .try_fold(Self::default(), |profile, mode| {
                Self::with_mode(&profile, mode.as_ref())
            })
    }

    /// Whether a user would see this browser.
    #[must_use]
    pub fn is_shown(&self) -> bool {
        self.visibility == Visibility::Visible
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transforms_do_not_mutate_base() {
        let base = BrowserProfile::default();
        let snapshot = base.clone();

        let hidden = BrowserProfile::with_mode(&base, "hidden").unwrap();
        let headless = BrowserProfile::with_mode(&base, "headless").unwrap();

        assert_eq!(base, snapshot);
        assert_eq!(hidden.visibility, Visibility::Hidden);
        assert_eq!(headless.visibility, Visibility::Headless);
        assert!(headless.capabilities.offscreen);
        assert!(!hidden.capabilities.offscreen);
    }

    #[test]
    fn test_unknown_mode_is_configuration_error() {
        let err = BrowserProfile::with_mode(&BrowserProfile::default(), "bogus").unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("bogus")));
    }

    #[test]
    fn test_mode_names_are_case_insensitive() {
        let profile = BrowserProfile::with_mode(&BrowserProfile::default(), " Hidden ").unwrap();
        assert_eq!(profile.applied_modes, vec!["hidden"]);
    }

    #[test]
    fn test_from_modes_records_lineage() {
        let profile = BrowserProfile::from_modes(&["hidden", "lite", "default"]).unwrap();
        assert_eq!(profile.applied_modes, vec!["hidden", "lite", "default"]);
        assert_eq!(profile.base, "lite");
        assert_eq!(profile.visibility, Visibility::Hidden);
        assert!(profile.capabilities.images, "default restores capabilities");
        assert!(!profile.is_shown());
    }

    #[test]
    fn test_default_keeps_offscreen_of_headless() {
        let profile = BrowserProfile::from_modes(&["headless", "default"]).unwrap();
        assert!(profile.capabilities.offscreen);
        assert_eq!(profile.visibility, Visibility::Headless);
    }

    #[test]
    fn test_from_modes_stops_at_first_unknown() {
        assert!(BrowserProfile::from_modes(&["hidden", "bogus", "default"]).is_err());
    }
}
