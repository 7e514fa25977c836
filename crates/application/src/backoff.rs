use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// 抖动因子范围
const JITTER_MIN: f64 = 0.8;
const JITTER_MAX: f64 = 1.2;

#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// `base × factor^n`，不超过 `max`
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
    },
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential {
            base,
            factor: 2.0,
            max: Duration::from_secs(3600),
        }
    }

    pub fn with_factor(self, factor: f64) -> Self {
        match self {
            Backoff::Exponential { base, max, .. } => Backoff::Exponential { base, factor, max },
        }
    }

    pub fn with_max(self, max: Duration) -> Self {
        match self {
            Backoff::Exponential { base, factor, .. } => Backoff::Exponential { base, factor, max },
        }
    }

    /// 第 `exponent` 次退避的基础延迟（不含抖动）
    pub fn delay_for(&self, exponent: u32) -> Duration {
        match self {
            Backoff::Exponential { base, factor, max } => {
                let exp = i32::try_from(exponent).unwrap_or(i32::MAX);
                let secs = base.as_secs_f64() * factor.powi(exp);
                let capped = secs.min(max.as_secs_f64());
                Duration::try_from_secs_f64(capped).unwrap_or(*max)
            }
        }
    }

    /// 在基础延迟上乘以 [0.8, 1.2] 的均匀随机因子
    pub fn jittered(&self, exponent: u32) -> Duration {
        let factor = rand::rng().random_range(JITTER_MIN..=JITTER_MAX);
        self.delay_for(exponent).mul_f64(factor)
    }
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

/// 执行异步操作，失败且可重试时按退避策略等待后重试
///
/// `op` 收到从 1 开始的尝试序号；第 n 次失败后等待 `backoff.delay_for(n - 1)`。
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    is_retryable: P,
    mut op: F,
) -> Result<T, (E, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= config.max_attempts || !is_retryable(&e) {
                    return Err((e, attempt));
                }
                let delay = config.backoff.delay_for(attempt - 1);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delay_is_capped() {
        let backoff = Backoff::exponential(Duration::from_secs(1)).with_max(Duration::from_secs(5));
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff::exponential(Duration::from_millis(1000))
            .with_factor(1.5)
            .with_max(Duration::from_secs(30));
        for n in 0..5u32 {
            let nominal = Duration::from_millis(1000)
                .mul_f64(1.5f64.powi(n as i32))
                .min(Duration::from_secs(30));
            for _ in 0..200 {
                let delay = backoff.jittered(n);
                assert!(delay >= nominal.mul_f64(0.8) - Duration::from_micros(1));
                assert!(delay <= nominal.mul_f64(1.2) + Duration::from_micros(1));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 5,
            backoff: Backoff::exponential(Duration::from_millis(10)),
        };
        let result: Result<(), (&str, u32)> = retry_async(
            &config,
            |e: &&str| *e != "fatal",
            |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(if n < 2 { "transient" } else { "fatal" }) }
            },
        )
        .await;

        assert_eq!(result, Err(("fatal", 2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_between_attempts() {
        let config = RetryConfig {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(1000)),
        };
        let started = tokio::time::Instant::now();
        let result: Result<u32, (&str, u32)> = retry_async(
            &config,
            |_| true,
            |n| async move { if n == 3 { Ok(n) } else { Err("transient") } },
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }
}
