//! 🧭 Runtime context: the metrics and the exit signal every component shares.
//!
//! Built once, cloned into constructors. No globals, so tests each get their own
//! registry and their own "please stop now" button.

use std::sync::Arc;

use prometheus::Registry;
use tokio::sync::watch;

use crate::metrics::Metrics;

/// 🛑 The "time to go home" flag. Cloned into every worker; flipped once.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// 🔔 Ring the bell. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// ⏳ Resolves once the signal fires (immediately if it already has).
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // a dropped sender can only mean shutdown too
        let _ = rx.wait_for(|set| *set).await;
    }
}

/// 🎒 What every component carries around.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub metrics: Arc<Metrics>,
    pub exit: ExitSignal,
}

impl RuntimeContext {
    /// 🏗️ Registers the metric set on `registry` and arms a fresh exit signal.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self { metrics: Arc::new(Metrics::new(registry)?), exit: ExitSignal::new() })
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> RuntimeContext {
    RuntimeContext::new(&Registry::new()).expect("💀 a fresh registry cannot already hold our metrics")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn the_one_where_everyone_hears_the_bell() {
        let exit = ExitSignal::new();
        let listener = exit.clone();
        let waiter = tokio::spawn(async move { listener.wait().await });
        assert!(!exit.is_set());
        exit.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("💀 waiter never woke up")
            .expect("💀 waiter panicked");
        assert!(exit.is_set());
    }
}
