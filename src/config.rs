//! Session configuration.
//!
//! All tunables the core recognizes live here; there is no CLI surface.
//! Settings-driven toggles from the embedding application are delivered as a
//! [`SessionConfig`] constructed through the validating builder.

use web_time::Duration;

use crate::error::BastionError;

/// Default cap on catch-up ticks executed in a single frame.
pub const DEFAULT_MAX_CATCH_UP_TICKS: u32 = 4;

/// Factor applied to the per-frame catch-up cap when aggressive catch-up is on.
pub const AGGRESSIVE_CATCH_UP_FACTOR: u32 = 2;

/// Default opinion window length in ticks.
pub const DEFAULT_OPINION_WINDOW: u32 = 30;

/// Default wall-clock slice a skip may consume per frame.
pub const DEFAULT_SKIP_SLICE_MS: u64 = 25;

/// Default number of ticks the authority stamps commands ahead of the
/// current tick (also the lead of the broadcast time bound).
pub const DEFAULT_COMMAND_LEAD_TICKS: u32 = 6;

/// Configuration consumed by the session core.
///
/// Construct through [`SessionConfig::builder`] to get validation, or fill the
/// fields directly when you know the values are sane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// The wire protocol version this peer speaks. A mismatch with any remote
    /// peer is always fatal.
    pub protocol_version: u16,
    /// Hard cap on ticks executed per frame while catching up. Prevents
    /// runaway catch-up after a stall.
    pub max_catch_up_ticks_per_frame: u32,
    /// Raises the per-frame catch-up cap by [`AGGRESSIVE_CATCH_UP_FACTOR`]
    /// for peers that prefer faster convergence over frame pacing.
    pub aggressive_catch_up: bool,
    /// How many diagnostic stack-trace hashes each opinion window retains.
    /// Zero disables trace collection entirely.
    pub desync_diagnostic_depth: usize,
    /// Opinion window length in ticks: how often state fingerprints are
    /// exchanged and compared.
    pub opinion_window: u32,
    /// Wall-clock budget a skip (fast-forward) may consume per frame, so a UI
    /// thread sharing the frame stays responsive.
    pub skip_slice: Duration,
    /// When `true`, each domain ticks at its own speed's multiplier; when
    /// `false`, every domain locksteps to the minimum multiplier across all
    /// domains.
    pub independent_domain_ticking: bool,
    /// How many ticks ahead of the current tick the authority stamps newly
    /// admitted commands and extends the broadcast time bound.
    pub command_lead_ticks: u32,
    /// `true` for the authority's non-interactive mirror instance:
    /// observation-dependent simulation side effects are suppressed.
    pub headless: bool,
    /// `true` while replaying a recorded session bundle: behind-schedule
    /// catch-up boosting is suppressed so playback speed stays steady.
    pub replay: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            max_catch_up_ticks_per_frame: DEFAULT_MAX_CATCH_UP_TICKS,
            aggressive_catch_up: false,
            desync_diagnostic_depth: 0,
            opinion_window: DEFAULT_OPINION_WINDOW,
            skip_slice: Duration::from_millis(DEFAULT_SKIP_SLICE_MS),
            independent_domain_ticking: false,
            command_lead_ticks: DEFAULT_COMMAND_LEAD_TICKS,
            headless: false,
            replay: false,
        }
    }
}

impl SessionConfig {
    /// Starts building a configuration from the defaults.
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// The effective per-frame catch-up cap, with the aggressive factor
    /// applied when configured.
    #[must_use]
    pub fn effective_max_catch_up(&self) -> u32 {
        if self.aggressive_catch_up {
            self.max_catch_up_ticks_per_frame * AGGRESSIVE_CATCH_UP_FACTOR
        } else {
            self.max_catch_up_ticks_per_frame
        }
    }
}

/// Validating builder for [`SessionConfig`].
///
/// # Example
///
/// ```
/// use bastion_lockstep::SessionConfig;
///
/// let config = SessionConfig::builder()
///     .protocol_version(3)
///     .max_catch_up_ticks_per_frame(6)
///     .aggressive_catch_up(true)
///     .desync_diagnostic_depth(16)
///     .build()
///     .expect("valid configuration");
/// assert_eq!(config.effective_max_catch_up(), 12);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Sets the wire protocol version.
    #[must_use]
    pub fn protocol_version(mut self, version: u16) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Sets the per-frame catch-up tick cap.
    #[must_use]
    pub fn max_catch_up_ticks_per_frame(mut self, ticks: u32) -> Self {
        self.config.max_catch_up_ticks_per_frame = ticks;
        self
    }

    /// Enables or disables aggressive catch-up.
    #[must_use]
    pub fn aggressive_catch_up(mut self, aggressive: bool) -> Self {
        self.config.aggressive_catch_up = aggressive;
        self
    }

    /// Sets how many diagnostic trace hashes each opinion retains.
    #[must_use]
    pub fn desync_diagnostic_depth(mut self, depth: usize) -> Self {
        self.config.desync_diagnostic_depth = depth;
        self
    }

    /// Sets the opinion window length in ticks.
    #[must_use]
    pub fn opinion_window(mut self, ticks: u32) -> Self {
        self.config.opinion_window = ticks;
        self
    }

    /// Sets the wall-clock slice a skip may consume per frame.
    #[must_use]
    pub fn skip_slice(mut self, slice: Duration) -> Self {
        self.config.skip_slice = slice;
        self
    }

    /// Selects independent per-domain ticking instead of lockstep-to-slowest.
    #[must_use]
    pub fn independent_domain_ticking(mut self, independent: bool) -> Self {
        self.config.independent_domain_ticking = independent;
        self
    }

    /// Sets the command/time-bound lead in ticks.
    #[must_use]
    pub fn command_lead_ticks(mut self, ticks: u32) -> Self {
        self.config.command_lead_ticks = ticks;
        self
    }

    /// Marks this instance as the authority's non-interactive mirror.
    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    /// Marks this session as an offline replay.
    #[must_use]
    pub fn replay(mut self, replay: bool) -> Self {
        self.config.replay = replay;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<SessionConfig, BastionError> {
        let config = self.config;
        if config.max_catch_up_ticks_per_frame == 0 {
            return Err(BastionError::InvalidRequest {
                info: "max_catch_up_ticks_per_frame must be at least 1".to_owned(),
            });
        }
        if config.max_catch_up_ticks_per_frame > 600 {
            return Err(BastionError::InvalidRequest {
                info: "max_catch_up_ticks_per_frame above 600 defeats frame pacing".to_owned(),
            });
        }
        if config.opinion_window == 0 {
            return Err(BastionError::InvalidRequest {
                info: "opinion_window must be at least 1 tick".to_owned(),
            });
        }
        if config.command_lead_ticks == 0 {
            return Err(BastionError::InvalidRequest {
                info: "command_lead_ticks must be at least 1".to_owned(),
            });
        }
        if config.skip_slice.is_zero() {
            return Err(BastionError::InvalidRequest {
                info: "skip_slice must be non-zero".to_owned(),
            });
        }
        Ok(config)
    }
}
