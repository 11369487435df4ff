use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;

/// A minute-aligned time series: calendar-minute key -> mean value for that
/// minute. BTreeMap keeps keys sorted, so intersections come out ordered.
pub type MinuteSeries = BTreeMap<String, f64>;

/// Calendar-minute key of a timestamp in the reference timezone.
pub fn minute_key(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string()
}

pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

/// Descriptive statistics over a series' values, rounded to 4 decimals the
/// way they are reported. `std` is the population deviation (divide by n).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesStats {
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

pub fn stats(series: &MinuteSeries) -> SeriesStats {
    let values: Vec<f64> = series.values().copied().collect();
    let count = values.len();
    if count == 0 {
        return SeriesStats {
            count: 0,
            mean: None,
            std: None,
            min: None,
            max: None,
        };
    }

    let mut min = values[0];
    let mut max = values[0];
    let mut sum = 0.0;
    for v in &values {
        min = min.min(*v);
        max = max.max(*v);
        sum += v;
    }
    let mean = sum / count as f64;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count as f64;

    SeriesStats {
        count,
        mean: Some(round_to(mean, 4)),
        std: Some(round_to(var.sqrt(), 4)),
        min: Some(round_to(min, 4)),
        max: Some(round_to(max, 4)),
    }
}

/// z-score of `latest` against already-rounded stats. Undefined when the
/// deviation is zero or the series was empty.
pub fn z_score(latest: f64, stats: &SeriesStats) -> Option<f64> {
    match (stats.mean, stats.std) {
        (Some(mean), Some(std)) if std > 0.0 => Some(round_to((latest - mean) / std, 2)),
        _ => None,
    }
}

/// Sorted minute keys present in every series of the list.
pub fn common_keys(series_list: &[&MinuteSeries]) -> Vec<String> {
    let Some((first, rest)) = series_list.split_first() else {
        return Vec::new();
    };
    first
        .keys()
        .filter(|key| rest.iter().all(|series| series.contains_key(*key)))
        .cloned()
        .collect()
}

/// Pearson correlation coefficient, rounded to 4 decimals. `None` when
/// fewer than 2 pairs exist or either variance is zero.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }

    let mean_x = xs[..n].iter().sum::<f64>() / n as f64;
    let mean_y = ys[..n].iter().sum::<f64>() / n as f64;

    let mut num = 0.0;
    let mut den_x = 0.0;
    let mut den_y = 0.0;
    for i in 0..n {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        num += dx * dy;
        den_x += dx * dx;
        den_y += dy * dy;
    }

    let den = (den_x * den_y).sqrt();
    if den <= 0.0 {
        return None;
    }
    Some(round_to(num / den, 4))
}

#[cfg(test)]
mod tests {
    use super::{common_keys, minute_key, pearson, stats, z_score, MinuteSeries};
    use chrono::{TimeZone, Utc};

    fn series(pairs: &[(&str, f64)]) -> MinuteSeries {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn minute_key_renders_in_the_reference_timezone() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 1, 12, 34, 56).unwrap();
        // Bucharest is UTC+3 in July.
        assert_eq!(
            minute_key(ts, chrono_tz::Europe::Bucharest),
            "2026-07-01 15:34"
        );
    }

    #[test]
    fn stats_uses_population_deviation() {
        let s = series(&[("a", 2.0), ("b", 4.0), ("c", 4.0), ("d", 4.0), ("e", 6.0)]);
        let st = stats(&s);
        assert_eq!(st.count, 5);
        assert_eq!(st.mean, Some(4.0));
        // Population std of [2,4,4,4,6] is sqrt(8/5).
        assert_eq!(st.std, Some(1.2649));
        assert_eq!(st.min, Some(2.0));
        assert_eq!(st.max, Some(6.0));
    }

    #[test]
    fn empty_series_has_null_stats() {
        let st = stats(&MinuteSeries::new());
        assert_eq!(st.count, 0);
        assert_eq!(st.mean, None);
        assert_eq!(st.std, None);
    }

    #[test]
    fn constant_series_yields_no_z_score() {
        let s = series(&[("a", 10.0), ("b", 10.0), ("c", 10.0), ("d", 10.0), ("e", 10.0)]);
        let st = stats(&s);
        assert_eq!(st.std, Some(0.0));
        assert_eq!(z_score(10.0, &st), None);
    }

    #[test]
    fn z_score_is_rounded_to_two_decimals() {
        let s = series(&[("a", 2.0), ("b", 4.0), ("c", 4.0), ("d", 4.0), ("e", 6.0)]);
        let st = stats(&s);
        // (7 - 4) / 1.2649 = 2.3717... -> 2.37
        assert_eq!(z_score(7.0, &st), Some(2.37));
    }

    #[test]
    fn common_keys_intersects_and_sorts() {
        let a = series(&[("00:01", 1.0), ("00:02", 2.0), ("00:03", 3.0)]);
        let b = series(&[("00:03", 9.0), ("00:01", 8.0)]);
        assert_eq!(common_keys(&[&a, &b]), vec!["00:01", "00:03"]);
        assert!(common_keys(&[]).is_empty());
    }

    #[test]
    fn pearson_matches_a_hand_computed_value() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let ys = [2.0, 4.0, 6.0, 8.0, 10.0];
        assert_eq!(pearson(&xs, &ys), Some(1.0));

        let ys_neg = [10.0, 8.0, 6.0, 4.0, 2.0];
        assert_eq!(pearson(&xs, &ys_neg), Some(-1.0));

        let ys_mixed = [2.0, 1.0, 4.0, 3.0, 5.0];
        assert_eq!(pearson(&xs, &ys_mixed), Some(0.8));
    }

    #[test]
    fn pearson_is_undefined_for_flat_or_tiny_input() {
        assert_eq!(pearson(&[1.0], &[2.0]), None);
        assert_eq!(pearson(&[3.0, 3.0, 3.0], &[1.0, 2.0, 3.0]), None);
    }
}
