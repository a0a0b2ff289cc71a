//! Cooperative cancellation shared by every thread
//!
//! Loops poll [`ShutdownToken::is_triggered`]; threads that block on a
//! channel can also `select!` on [`ShutdownToken::signal`], which becomes
//! ready (disconnected) the moment shutdown is triggered.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crossbeam_channel::{bounded, Receiver, Sender};

/// Owner side, held by whoever decides to stop (signal handler, fatal error path)
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

/// Observer side handed to each thread
#[derive(Clone)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
    receiver: Receiver<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            flag: self.flag.clone(),
            receiver: self.receiver.clone(),
        }
    }

    /// Idempotent
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // Dropping the only sender disconnects every receiver
        match self.sender.lock() {
            Ok(mut sender) => drop(sender.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl ShutdownToken {
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Never yields a value; becomes disconnected once shutdown is triggered
    pub fn signal(&self) -> &Receiver<()> {
        &self.receiver
    }
}
