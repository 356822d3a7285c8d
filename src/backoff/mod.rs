use log::warn;

use crate::store::{StoreDocument, BACKOFF_BASE_KEY};

/// Base used when the store config has none
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;

/// Longest delay a failed job is held back, in seconds
pub const MAX_BACKOFF_DELAY_SECS: u64 = 100;

/// Exponential backoff for job retries: `min(base^attempts, cap)` seconds
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffOptions {
    pub base: f64,
    pub cap_secs: u64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        BackoffOptions {
            base: DEFAULT_BACKOFF_BASE,
            cap_secs: MAX_BACKOFF_DELAY_SECS,
        }
    }
}

impl BackoffOptions {
    /// Read `backoffBase` from the document config.
    ///
    /// Negative or non-finite bases are replaced with the default.
    pub fn from_document(document: &StoreDocument) -> Self {
        let base = document.config_number(BACKOFF_BASE_KEY, DEFAULT_BACKOFF_BASE);
        let base = if base.is_finite() && base >= 0.0 {
            base
        } else {
            warn!("backoffBase {} is unusable, using {}", base, DEFAULT_BACKOFF_BASE);
            DEFAULT_BACKOFF_BASE
        };

        BackoffOptions {
            base,
            ..Default::default()
        }
    }
}

/// Delay in seconds before a job that has failed `attempts` times is retried
pub fn calculate_backoff(options: &BackoffOptions, attempts: u32) -> u64 {
    let delay = options.base.powf(attempts as f64);
    let cap = options.cap_secs as f64;

    if !delay.is_finite() || delay >= cap {
        options.cap_secs
    } else {
        delay.ceil() as u64
    }
}

/// Epoch second at which a job failed at `now` becomes claimable again
pub fn get_backoff_timestamp(options: &BackoffOptions, attempts: u32, now: i64) -> i64 {
    now + calculate_backoff(options, attempts) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let options = BackoffOptions::default();

        assert_eq!(calculate_backoff(&options, 0), 1);
        assert_eq!(calculate_backoff(&options, 1), 2);
        assert_eq!(calculate_backoff(&options, 2), 4);
        assert_eq!(calculate_backoff(&options, 3), 8);
        assert_eq!(calculate_backoff(&options, 6), 64);
    }

    #[test]
    fn test_backoff_is_capped() {
        let options = BackoffOptions::default();

        assert_eq!(calculate_backoff(&options, 7), 100);
        assert_eq!(calculate_backoff(&options, 50), 100);
        assert_eq!(calculate_backoff(&options, u32::MAX), 100);
    }

    #[test]
    fn test_backoff_is_monotonic() {
        for base in [1.0, 1.5, 2.0, 3.0, 10.0] {
            let options = BackoffOptions { base, ..Default::default() };
            let delays: Vec<u64> = (1..20).map(|n| calculate_backoff(&options, n)).collect();

            assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]), "base {}", base);
            assert!(delays.iter().all(|delay| *delay <= MAX_BACKOFF_DELAY_SECS));
        }
    }

    #[test]
    fn test_base_read_from_document() {
        let mut document = StoreDocument::default();
        assert_eq!(BackoffOptions::from_document(&document).base, 2.0);

        document.config.insert(BACKOFF_BASE_KEY.into(), "3".into());
        assert_eq!(BackoffOptions::from_document(&document).base, 3.0);

        document.config.insert(BACKOFF_BASE_KEY.into(), "0.5".into());
        assert_eq!(BackoffOptions::from_document(&document).base, 0.5);

        document.config.insert(BACKOFF_BASE_KEY.into(), "-3".into());
        assert_eq!(BackoffOptions::from_document(&document).base, 2.0);

        document.config.insert(BACKOFF_BASE_KEY.into(), "NaN".into());
        assert_eq!(BackoffOptions::from_document(&document).base, 2.0);
    }

    #[test]
    fn test_fractional_and_zero_bases() {
        let half = BackoffOptions { base: 0.5, ..Default::default() };
        assert_eq!(calculate_backoff(&half, 1), 1);
        assert_eq!(calculate_backoff(&half, 4), 1);

        let zero = BackoffOptions { base: 0.0, ..Default::default() };
        assert_eq!(calculate_backoff(&zero, 1), 0);
        assert_eq!(calculate_backoff(&zero, 0), 1);
    }

    #[test]
    fn test_backoff_timestamp() {
        let options = BackoffOptions::default();
        assert_eq!(get_backoff_timestamp(&options, 2, 1_000), 1_004);
    }
}
