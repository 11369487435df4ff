use crate::settings::AppSettings;

pub const DEFAULT_WINDOW_MINUTES: i64 = 60;
pub const DEFAULT_Z_WARN: f64 = 2.0;
pub const DEFAULT_Z_CRITICAL: f64 = 3.0;
pub const DEFAULT_STALENESS_THRESHOLD_S: i64 = 180;

/// Tuning knobs for a fleet-health computation. Values are always clamped
/// to sane operating ranges on construction, so a bad stored setting or a
/// hostile override can only ever narrow or widen the window, never break
/// the math.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InsightsParams {
    pub window_minutes: i64,
    pub z_warn: f64,
    pub z_critical: f64,
    pub staleness_threshold_s: i64,
}

impl Default for InsightsParams {
    fn default() -> Self {
        Self {
            window_minutes: DEFAULT_WINDOW_MINUTES,
            z_warn: DEFAULT_Z_WARN,
            z_critical: DEFAULT_Z_CRITICAL,
            staleness_threshold_s: DEFAULT_STALENESS_THRESHOLD_S,
        }
    }
}

impl InsightsParams {
    pub fn clamped(
        window_minutes: i64,
        z_warn: f64,
        z_critical: f64,
        staleness_threshold_s: i64,
    ) -> Self {
        let window_minutes = window_minutes.clamp(10, 360);
        let z_warn = z_warn.clamp(0.5, 10.0);
        // The critical band sits at or above the warning band.
        let z_critical = z_critical.clamp(0.5, 10.0).max(z_warn);
        let staleness_threshold_s = staleness_threshold_s.clamp(10, 3600);
        Self {
            window_minutes,
            z_warn,
            z_critical,
            staleness_threshold_s,
        }
    }

    /// Load stored defaults, then apply any caller overrides on top.
    pub async fn resolve(
        settings: &AppSettings,
        window_minutes: Option<i64>,
        z_warn: Option<f64>,
        z_critical: Option<f64>,
        staleness_threshold_s: Option<i64>,
    ) -> Self {
        let stored = Self::from_settings(settings).await;
        Self::clamped(
            window_minutes.unwrap_or(stored.window_minutes),
            z_warn.unwrap_or(stored.z_warn),
            z_critical.unwrap_or(stored.z_critical),
            staleness_threshold_s.unwrap_or(stored.staleness_threshold_s),
        )
    }

    pub async fn from_settings(settings: &AppSettings) -> Self {
        let window_minutes = settings
            .get_i64("distributed.window_minutes", DEFAULT_WINDOW_MINUTES)
            .await;
        let z_warn = settings.get_f64("distributed.z_warn", DEFAULT_Z_WARN).await;
        let z_critical = settings
            .get_f64("distributed.z_critical", DEFAULT_Z_CRITICAL)
            .await;
        let staleness_threshold_s = settings
            .get_i64(
                "distributed.staleness_threshold_s",
                DEFAULT_STALENESS_THRESHOLD_S,
            )
            .await;
        Self::clamped(window_minutes, z_warn, z_critical, staleness_threshold_s)
    }
}
