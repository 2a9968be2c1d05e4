//! Escalations - failures propagating through the scheduler.
//!
//! An [`Escalation`] wraps any error raised by application logic. It is
//! cheap to clone because the same escalation is handed to handlers, captured
//! as a thread's terminal escalation and logged.
//!
//! `Escalation` does not implement `std::error::Error`; every error type
//! converts into it with `?`.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// A failure raised while executing a function
#[derive(Clone)]
pub struct Escalation(Arc<dyn Error + Send + Sync + 'static>);

impl Escalation {
    /// Wrap an error
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Create an escalation from a plain message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(MessageEscalation(message.into()))
    }

    /// Create an escalation from a caught panic payload
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(Panicked { message })
    }

    /// Check whether the wrapped error is of type `E`
    #[must_use]
    pub fn is<E>(&self) -> bool
    where
        E: Error + 'static,
    {
        self.0.is::<E>()
    }

    /// Downcast to the wrapped error type
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Error + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Borrow the wrapped error
    #[must_use]
    pub fn inner(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.0
    }

    /// Whether two handles refer to the same escalation instance
    #[must_use]
    pub fn same_as(&self, other: &Escalation) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<E> From<E> for Escalation
where
    E: Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Escalation").field(&self.0).finish()
    }
}

/// Escalation carrying only a message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MessageEscalation(pub String);

/// Escalation raised when function logic panicked
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("function panicked: {message}")]
pub struct Panicked {
    /// Panic message
    pub message: String,
}
