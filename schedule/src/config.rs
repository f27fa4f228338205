//! Search configuration.
//!
//! Provides typed configuration for the beam search with bon builders.
//! Supports both explicit configuration and environment variable fallbacks.

use bon::bon;

/// Architecture description consumed by cost models. Only the core count is
/// interpreted by this crate.
#[derive(Debug, Clone, Copy)]
pub struct MachineParams {
    /// Number of cores to target.
    pub parallelism: i32,
}

impl Default for MachineParams {
    fn default() -> Self {
        Self { parallelism: 16 }
    }
}

impl MachineParams {
    /// Read from `TESSERA_MACHINE_PARAMS` (first term = core count).
    pub fn from_env() -> Self {
        let parallelism = std::env::var("TESSERA_MACHINE_PARAMS")
            .ok()
            .and_then(|s| s.split(',').next().and_then(|t| t.parse().ok()))
            .unwrap_or(16);
        Self { parallelism }
    }
}

/// Configuration for the coarse-to-fine beam search.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Width of the beam. 1 gives a greedy single pass.
    pub beam_size: usize,
    /// Coarse-to-fine pass count. Ignored (forced to 1) when `beam_size`
    /// is 1 or interactive mode is on.
    pub num_passes: usize,
    /// 0-100. Chance of accepting each state, amortized across the number
    /// of decisions. 100 disables dropout.
    pub random_dropout_percent: f64,
    /// Seed for the dropout RNG.
    pub random_seed: u64,
    /// "Choose-your-own-schedule": the user navigates the search by hand.
    pub interactive: bool,
    /// Run a `pass_idx = -1` pre-pass and freeze the lowest-cost stages
    /// before the real passes.
    pub freeze_inline_compute_root: bool,
    /// Limit the search space to single-level tilings.
    pub no_subtiling: bool,
    /// Passed through to schedule application; tells the compiler not to
    /// reject unrolling loops it cannot prove constant. Does not affect the
    /// search itself.
    pub permit_failed_unroll: bool,
    /// On total mortality, double the beam size and restart instead of
    /// aborting. Off by default: running out of legal states usually
    /// indicates a bug.
    pub double_beam_on_mortality: bool,
    /// States within this fraction of the pass winner's cost get their
    /// ancestor hashes blessed for the next pass.
    pub bless_margin: f64,
    /// Penalty added to states whose coarse hash was not blessed by the
    /// previous pass.
    pub impermissible_penalty: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            beam_size: 32,
            num_passes: 5,
            random_dropout_percent: 100.0,
            random_seed: 0,
            interactive: false,
            freeze_inline_compute_root: false,
            no_subtiling: false,
            permit_failed_unroll: false,
            double_beam_on_mortality: false,
            bless_margin: 0.2,
            impermissible_penalty: 10,
        }
    }
}

#[bon]
impl SearchParams {
    /// Create search parameters with the builder pattern.
    #[builder]
    pub fn builder(
        #[builder(default = 32)] beam_size: usize,
        #[builder(default = 5)] num_passes: usize,
        #[builder(default = 100.0)] random_dropout_percent: f64,
        #[builder(default = 0)] random_seed: u64,
        #[builder(default = false)] interactive: bool,
        #[builder(default = false)] freeze_inline_compute_root: bool,
        #[builder(default = false)] no_subtiling: bool,
        #[builder(default = false)] permit_failed_unroll: bool,
        #[builder(default = false)] double_beam_on_mortality: bool,
        #[builder(default = 0.2)] bless_margin: f64,
        #[builder(default = 10)] impermissible_penalty: usize,
    ) -> Self {
        Self {
            beam_size,
            num_passes,
            random_dropout_percent,
            random_seed,
            interactive,
            freeze_inline_compute_root,
            no_subtiling,
            permit_failed_unroll,
            double_beam_on_mortality,
            bless_margin,
            impermissible_penalty,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `TESSERA_BEAM_SIZE` - beam width (default: 32)
    /// * `TESSERA_NUM_PASSES` - coarse-to-fine passes (default: 5)
    /// * `TESSERA_RANDOM_DROPOUT` - percent chance of accepting each state
    /// * `TESSERA_SEED` - dropout RNG seed
    /// * `TESSERA_CYOS` - set to 1 to navigate the search by hand
    /// * `TESSERA_FREEZE_INLINE_COMPUTE_ROOT` - set to 1 for the pre-pass
    /// * `TESSERA_NO_SUBTILING` - set to 1 to limit the tiling family
    /// * `TESSERA_PERMIT_FAILED_UNROLL` - forwarded to schedule application
    pub fn from_env() -> Self {
        let flag = |name: &str| std::env::var(name).is_ok_and(|v| v == "1");
        let defaults = Self::default();
        Self {
            beam_size: parse_env("TESSERA_BEAM_SIZE", defaults.beam_size),
            num_passes: parse_env("TESSERA_NUM_PASSES", defaults.num_passes),
            random_dropout_percent: parse_env("TESSERA_RANDOM_DROPOUT", defaults.random_dropout_percent),
            random_seed: parse_env("TESSERA_SEED", defaults.random_seed),
            interactive: flag("TESSERA_CYOS"),
            freeze_inline_compute_root: flag("TESSERA_FREEZE_INLINE_COMPUTE_ROOT"),
            no_subtiling: flag("TESSERA_NO_SUBTILING"),
            permit_failed_unroll: flag("TESSERA_PERMIT_FAILED_UNROLL"),
            ..defaults
        }
    }

    /// Effective pass count: greedy and interactive searches get one pass.
    pub fn effective_num_passes(&self) -> usize {
        if self.beam_size == 1 || self.interactive { 1 } else { self.num_passes.max(1) }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}
