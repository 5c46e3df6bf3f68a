//! Send-path middleware.
//!
//! An [`InterceptorChain`] is an ordered list of named functions built once
//! with [`InterceptorChainBuilder`]. Each function receives the message and
//! a [`Next`] continuation; calling `next.run(message)` passes control to the
//! following interceptor and finally to the send operation itself. Returning
//! without calling `next` stops the send.

use std::fmt;
use std::sync::Arc;

use crate::message::Message;
use crate::Result;

type InterceptorFn = dyn Fn(&mut Message, Next<'_>) -> Result<()> + Send + Sync;

#[derive(Clone)]
struct Interceptor {
    name: String,
    call: Arc<InterceptorFn>,
}

/// The rest of the chain, ending in the intercepted operation.
pub struct Next<'a> {
    rest: &'a [Interceptor],
    operation: &'a mut dyn FnMut(&mut Message) -> Result<()>,
}

impl<'a> Next<'a> {
    pub fn run(self, message: &mut Message) -> Result<()> {
        match self.rest.split_first() {
            Some((first, rest)) => (first.call)(
                message,
                Next {
                    rest,
                    operation: self.operation,
                },
            ),
            None => (self.operation)(message),
        }
    }
}

#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Interceptor>,
}

impl InterceptorChain {
    pub fn builder() -> InterceptorChainBuilder {
        InterceptorChainBuilder::default()
    }

    /// Run `message` through every interceptor, then `operation`.
    pub fn invoke(
        &self,
        message: &mut Message,
        mut operation: impl FnMut(&mut Message) -> Result<()>,
    ) -> Result<()> {
        Next {
            rest: &self.interceptors,
            operation: &mut operation,
        }
        .run(message)
    }

    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("interceptors", &self.names())
            .finish()
    }
}

#[derive(Default)]
pub struct InterceptorChainBuilder {
    interceptors: Vec<Interceptor>,
}

impl InterceptorChainBuilder {
    /// Append an interceptor; earlier ones run first.
    pub fn with(
        mut self,
        name: impl Into<String>,
        interceptor: impl Fn(&mut Message, Next<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.interceptors.push(Interceptor {
            name: name.into(),
            call: Arc::new(interceptor),
        });
        self
    }

    pub fn build(self) -> InterceptorChain {
        InterceptorChain {
            interceptors: self.interceptors,
        }
    }
}
