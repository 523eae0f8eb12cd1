//! Long-lived guest runtime.
//!
//! A guest is one QuickJS runtime with a hard memory ceiling and an
//! interrupt hook. It is created by the pool, reused across invocations
//! (one at a time), and dropped for good once corrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use funclite_shared::{FuncliteError, FuncliteResult};
use rquickjs::AsyncRuntime;
use tokio_util::sync::CancellationToken;

const MIB: usize = 1024 * 1024;
// Stack depth for guest scripts; well under the host thread stack.
const GUEST_STACK_BYTES: usize = 1024 * 1024;

/// Shared interrupt state checked by QuickJS on an instruction budget.
///
/// The deadline covers the wall-clock timeout (busy loops included); the
/// token covers host-initiated cancellation. Either one firing ends the
/// current script, and the engine then retires the guest.
#[derive(Debug)]
pub struct GuestInterrupt {
    token: CancellationToken,
    deadline_epoch_ms: AtomicU64,
}

impl GuestInterrupt {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline_epoch_ms: AtomicU64::new(0),
        }
    }

    /// Arm the wall-clock deadline for the invocation about to run.
    pub fn arm(&self, timeout: Duration) {
        let deadline = now_epoch_ms().saturating_add(timeout.as_millis() as u64);
        self.deadline_epoch_ms.store(deadline, Ordering::SeqCst);
    }

    /// Clear the deadline after the invocation finished.
    pub fn disarm(&self) {
        self.deadline_epoch_ms.store(0, Ordering::SeqCst);
    }

    /// Cancel the guest outright. Terminal: the guest must not be reused.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token observed by async bridge calls of the current invocation.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline_passed(&self) -> bool {
        let deadline = self.deadline_epoch_ms.load(Ordering::SeqCst);
        deadline != 0 && now_epoch_ms() >= deadline
    }

    fn should_interrupt(&self) -> bool {
        self.token.is_cancelled() || self.deadline_passed()
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One isolated JavaScript execution domain.
pub struct Guest {
    runtime: AsyncRuntime,
    interrupt: Arc<GuestInterrupt>,
    memory_limit_mb: u32,
}

impl Guest {
    /// Build a runtime with the configured heap ceiling and interrupt hook.
    pub async fn create(memory_limit_mb: u32) -> FuncliteResult<Self> {
        let runtime = AsyncRuntime::new()
            .map_err(|e| FuncliteError::Internal(format!("failed to create guest runtime: {}", e)))?;
        runtime
            .set_memory_limit(memory_limit_mb as usize * MIB)
            .await;
        runtime.set_max_stack_size(GUEST_STACK_BYTES).await;

        let interrupt = Arc::new(GuestInterrupt::new());
        let hook = Arc::clone(&interrupt);
        runtime
            .set_interrupt_handler(Some(Box::new(move || hook.should_interrupt())))
            .await;

        Ok(Self {
            runtime,
            interrupt,
            memory_limit_mb,
        })
    }

    pub fn runtime(&self) -> &AsyncRuntime {
        &self.runtime
    }

    pub fn interrupt(&self) -> &Arc<GuestInterrupt> {
        &self.interrupt
    }

    pub fn memory_limit_mb(&self) -> u32 {
        self.memory_limit_mb
    }

    /// A guest whose token fired is unusable by definition.
    pub fn is_healthy(&self) -> bool {
        !self.interrupt.is_canceled()
    }
}

impl std::fmt::Debug for Guest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guest")
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}
