//! 有界重试：指数退避（基数翻倍、封顶），按错误分类决定是否重试

use std::future::Future;
use std::time::Duration;

use crate::sandbox::{ErrorClass, SandboxError};

/// 重试策略：max_attempts 为总尝试次数（含首次）
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// 第 attempt 次（从 1 开始）失败后的等待时长：base * 2^(attempt-1)，不超过 max_delay
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// 执行 op，失败时按分类重试
///
/// - Permanent：立即返回原错误，不再尝试
/// - Transient：等待 delay_for(attempt) 后重试，直到 max_attempts，最终返回 RetriesExhausted
///
/// 闭包参数为当前尝试序号（从 1 开始）。
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    mut f: F,
) -> Result<T, SandboxError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SandboxError>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if e.class() == ErrorClass::Permanent => {
                tracing::debug!(op, attempt, error = %e, "permanent sandbox error, not retrying");
                return Err(e);
            }
            Err(e) if attempt >= max => {
                tracing::warn!(op, attempts = attempt, error = %e, "sandbox retries exhausted");
                return Err(SandboxError::RetriesExhausted {
                    op,
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    op,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient sandbox error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(50))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(6, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn test_default_delays_strictly_increase() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (1..policy.max_attempts).map(|a| policy.delay_for(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_permanent_error_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(), "read_file", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SandboxError::runtime("read_file", "No such file or directory")) }
        })
        .await;
        assert!(matches!(result, Err(SandboxError::Runtime { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_error_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(), "exec", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SandboxError::runtime("exec", "connection refused")) }
        })
        .await;
        match result {
            Err(SandboxError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let result = with_retry(&fast_policy(), "exec", |attempt| async move {
            if attempt < 2 {
                Err(SandboxError::runtime("exec", "resource busy"))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
