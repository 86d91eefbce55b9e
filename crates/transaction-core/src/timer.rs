//! Timer configuration and the timer manager.
//!
//! RFC 3261 Section 17 drives every transaction with a handful of named
//! timers: retransmission timers (A, E, G) that double their interval,
//! absolute timeouts (B, F, H), and wait timers absorbing retransmissions
//! after a final response (D, I, J, K). The [`TimerManager`] provides
//! one-shot timers only; a transaction that needs a doubling interval
//! restarts its timer with the next duration when it fires.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::event::InternalTransactionCommand;
use crate::key::TransactionKey;

/// Timer durations, defaulting to RFC 3261 Section 17 values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSettings {
    /// T1, the RTT estimate and initial retransmit interval (500 ms)
    pub t1: Duration,
    /// T2, the retransmit interval cap for non-INVITE requests and INVITE
    /// responses (4 s)
    pub t2: Duration,
    /// T4, the maximum lifetime of a message in the network (5 s)
    pub t4: Duration,
    /// Timers B and F, the request timeout (64·T1)
    pub transaction_timeout: Duration,
    /// Timer D, the wait for response retransmissions after a non-2xx
    /// final to an INVITE (at least 32 s for unreliable transports)
    pub wait_time_d: Duration,
    /// Timer H, the wait for an ACK before giving up (64·T1)
    pub wait_time_h: Duration,
    /// Timer I, the wait for ACK retransmissions in Confirmed (T4)
    pub wait_time_i: Duration,
    /// Timer J, the wait for request retransmissions in Completed (64·T1)
    pub wait_time_j: Duration,
    /// Timer K, the wait for response retransmissions in Completed (T4)
    pub wait_time_k: Duration,
    /// Delay before a server INVITE transaction emits an automatic
    /// `100 Trying` when the TU has not responded (200 ms)
    pub provisional_delay: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        let t1 = Duration::from_millis(500);
        Self {
            t1,
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            transaction_timeout: t1 * 64,
            wait_time_d: Duration::from_secs(32),
            wait_time_h: t1 * 64,
            wait_time_i: Duration::from_secs(5),
            wait_time_j: t1 * 64,
            wait_time_k: Duration::from_secs(5),
            provisional_delay: Duration::from_millis(200),
        }
    }
}

impl TimerSettings {
    /// Doubles a retransmit interval, optionally capping at T2.
    pub fn next_backoff(&self, current: Duration, cap_at_t2: bool) -> Duration {
        let doubled = current * 2;
        if cap_at_t2 && doubled > self.t2 {
            self.t2
        } else {
            doubled
        }
    }

    /// Timer D duration: zero on reliable transports.
    pub fn wait_time_d_for(&self, reliable: bool) -> Duration {
        if reliable { Duration::ZERO } else { self.wait_time_d }
    }

    /// Timer I duration: zero on reliable transports.
    pub fn wait_time_i_for(&self, reliable: bool) -> Duration {
        if reliable { Duration::ZERO } else { self.wait_time_i }
    }

    /// Timer J duration: zero on reliable transports.
    pub fn wait_time_j_for(&self, reliable: bool) -> Duration {
        if reliable { Duration::ZERO } else { self.wait_time_j }
    }

    /// Timer K duration: zero on reliable transports.
    pub fn wait_time_k_for(&self, reliable: bool) -> Duration {
        if reliable { Duration::ZERO } else { self.wait_time_k }
    }
}

/// The timers a transaction can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// INVITE client retransmission
    A,
    /// INVITE client timeout
    B,
    /// INVITE client wait in Completed
    D,
    /// Non-INVITE client retransmission
    E,
    /// Non-INVITE client timeout
    F,
    /// INVITE server response retransmission
    G,
    /// INVITE server wait for ACK
    H,
    /// INVITE server wait in Confirmed
    I,
    /// Non-INVITE server wait in Completed
    J,
    /// Non-INVITE client wait in Completed
    K,
    /// INVITE server automatic 100 Trying
    Provisional,
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerType::A => "A",
            TimerType::B => "B",
            TimerType::D => "D",
            TimerType::E => "E",
            TimerType::F => "F",
            TimerType::G => "G",
            TimerType::H => "H",
            TimerType::I => "I",
            TimerType::J => "J",
            TimerType::K => "K",
            TimerType::Provisional => "Provisional",
        };
        f.write_str(name)
    }
}

/// Schedules one-shot timers for registered transactions.
///
/// When a timer fires, an [`InternalTransactionCommand::Timer`] carrying
/// the timer's name is sent to the transaction's command channel. Timers
/// firing after a transaction unregistered are dropped silently;
/// cancellation of an individual timer is the owner's job via the returned
/// [`JoinHandle`].
#[derive(Debug)]
pub struct TimerManager {
    transaction_channels: Arc<Mutex<HashMap<TransactionKey, mpsc::Sender<InternalTransactionCommand>>>>,
}

impl TimerManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self {
            transaction_channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a transaction's command channel for timer delivery.
    pub async fn register_transaction(
        &self,
        transaction_id: TransactionKey,
        command_tx: mpsc::Sender<InternalTransactionCommand>,
    ) {
        let mut channels = self.transaction_channels.lock().await;
        if channels.insert(transaction_id.clone(), command_tx).is_some() {
            debug!(id = %transaction_id, "timer channel replaced for registered transaction");
        }
        trace!(id = %transaction_id, "transaction registered with timer manager");
    }

    /// Unregisters a transaction; timers still in flight fire into the
    /// void.
    pub async fn unregister_transaction(&self, transaction_id: &TransactionKey) {
        let mut channels = self.transaction_channels.lock().await;
        if channels.remove(transaction_id).is_some() {
            trace!(id = %transaction_id, "transaction unregistered from timer manager");
        }
    }

    /// Starts a one-shot timer. The returned handle aborts the timer when
    /// dropped into `JoinHandle::abort`.
    pub async fn start_timer(
        &self,
        transaction_id: TransactionKey,
        timer_type: TimerType,
        duration: Duration,
    ) -> JoinHandle<()> {
        let channels = self.transaction_channels.clone();
        tokio::spawn(async move {
            trace!(id = %transaction_id, timer = %timer_type, ?duration, "timer started");
            sleep(duration).await;

            let guard = channels.lock().await;
            if let Some(cmd_tx) = guard.get(&transaction_id) {
                let payload = timer_type.to_string();
                if cmd_tx
                    .send(InternalTransactionCommand::Timer(payload))
                    .await
                    .is_err()
                {
                    debug!(id = %transaction_id, timer = %timer_type,
                           "timer fired but the transaction loop is gone");
                }
            } else {
                trace!(id = %transaction_id, timer = %timer_type,
                       "timer fired after unregistration");
            }
        })
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}
