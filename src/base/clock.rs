//! Wall-clock access, injectable for tests.

use std::{ops::Deref, sync::Arc};

use chrono::{DateTime, Utc};

/// Generic clock trait.
pub trait GenericClock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock handle for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<dyn GenericClock>,
}

impl Deref for Clock {
    type Target = dyn GenericClock;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl Clock {
    pub fn new(inner: Arc<dyn GenericClock>) -> Self {
        Self { inner }
    }

    /// The system UTC clock.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// A clock frozen at `at`.
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self::new(Arc::new(FixedClock(at)))
    }
}

struct SystemClock;

impl GenericClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct FixedClock(DateTime<Utc>);

impl GenericClock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
