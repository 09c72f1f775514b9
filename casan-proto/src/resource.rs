//! Application resources and their request handlers

use std::fmt;

use crate::message::{Code, Message};
use crate::token::Token;

/// Number of request methods a resource can carry handlers for
pub(crate) const METHOD_COUNT: usize = 4;

/// Serves requests for one method on one resource
///
/// The handler fills in the response payload (and any options beyond the
/// defaults) and returns the response code. For observe notifications there
/// is no triggering request, so `req` is `None`.
pub trait Handler {
    /// Produce a response for `req` into `resp`
    fn handle(&mut self, req: Option<&Message>, resp: &mut Message) -> Code;
}

impl<F> Handler for F
where
    F: FnMut(Option<&Message>, &mut Message) -> Code,
{
    fn handle(&mut self, req: Option<&Message>, resp: &mut Message) -> Code {
        self(req, resp)
    }
}

/// Decides when an observed resource has changed
///
/// Polled once per engine tick while an observation is registered.
pub trait Observer {
    /// Whether a notification should be sent now
    fn trigger(&mut self) -> bool;

    /// Called when a peer registers an observation, with the request
    fn on_register(&mut self, _req: &Message) {}

    /// Called when the observation is cancelled
    fn on_deregister(&mut self) {}
}

/// A resource exposed by the slave
///
/// Carries the metadata advertised in the aggregate listing, up to one
/// handler per method, and the observation state for the single supported
/// observer.
pub struct Resource {
    name: String,
    title: String,
    rt: String,
    handlers: [Option<Box<dyn Handler>>; METHOD_COUNT],
    observer: Option<Box<dyn Observer>>,
    observed: bool,
    obs_serial: u32,
    obs_token: Token,
}

impl Resource {
    /// Create a resource with its advertised metadata
    pub fn new(
        name: impl Into<String>,
        title: impl Into<String>,
        rt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            rt: rt.into(),
            handlers: Default::default(),
            observer: None,
            observed: false,
            obs_serial: 0,
            obs_token: Token::empty(),
        }
    }

    /// The path segment this resource answers to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the handler for one request method, replacing any previous one
    ///
    /// Non-method codes are ignored.
    pub fn set_handler(&mut self, method: Code, handler: impl Handler + 'static) {
        if let Some(idx) = method.method_index() {
            self.handlers[idx] = Some(Box::new(handler));
        }
    }

    /// Install the observer deciding when notifications fire
    pub fn set_observer(&mut self, observer: impl Observer + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// Whether an observation is currently registered
    pub fn observed(&self) -> bool {
        self.observed
    }

    pub(crate) fn handler_mut(&mut self, method: Code) -> Option<&mut Box<dyn Handler>> {
        self.handlers[method.method_index()?].as_mut()
    }

    /// Register or cancel the observation
    ///
    /// Ignored when no observer is installed. Registration records the
    /// request token for notifications and restarts the serial at 2, leaving
    /// 1 for the registration response itself.
    pub(crate) fn set_observed(&mut self, onoff: bool, req: Option<&Message>) {
        let Some(observer) = self.observer.as_mut() else {
            return;
        };
        if self.observed && !onoff {
            observer.on_deregister();
        }
        self.observed = onoff;
        if onoff {
            self.obs_serial = 2;
            if let Some(req) = req {
                self.obs_token = req.token();
                observer.on_register(req);
            }
        }
    }

    /// Poll the observer; false when not observed or not triggered
    pub(crate) fn check_trigger(&mut self) -> bool {
        if !self.observed {
            return false;
        }
        match self.observer.as_mut() {
            Some(observer) => observer.trigger(),
            None => false,
        }
    }

    /// The serial for the next notification
    pub(crate) fn next_serial(&mut self) -> u32 {
        let serial = self.obs_serial;
        self.obs_serial += 1;
        serial
    }

    /// Token the observation was registered with
    pub(crate) fn obs_token(&self) -> Token {
        self.obs_token
    }

    /// The `<name>;title="...";rt="..."` descriptor for the aggregate listing
    pub(crate) fn well_known(&self) -> String {
        format!("<{}>;title=\"{}\";rt=\"{}\"", self.name, self.title, self.rt)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("title", &self.title)
            .field("rt", &self.rt)
            .field("observed", &self.observed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_format() {
        let res = Resource::new("temp", "temperature", "celsius");
        assert_eq!(res.well_known(), "<temp>;title=\"temperature\";rt=\"celsius\"");
    }

    #[test]
    fn handlers_are_per_method() {
        let mut res = Resource::new("x", "x", "x");
        res.set_handler(Code::GET, |_req: Option<&Message>, _resp: &mut Message| {
            Code::CONTENT
        });
        assert!(res.handler_mut(Code::GET).is_some());
        assert!(res.handler_mut(Code::POST).is_none());
        assert!(res.handler_mut(Code::CONTENT).is_none());
    }

    #[test]
    fn observation_needs_an_observer() {
        let mut res = Resource::new("x", "x", "x");
        res.set_observed(true, None);
        assert!(!res.observed());
        assert!(!res.check_trigger());
    }

    struct CountingObserver {
        fire: bool,
        registered: u32,
        deregistered: u32,
    }

    impl Observer for CountingObserver {
        fn trigger(&mut self) -> bool {
            self.fire
        }
        fn on_register(&mut self, _req: &Message) {
            self.registered += 1;
        }
        fn on_deregister(&mut self) {
            self.deregistered += 1;
        }
    }

    #[test]
    fn observation_lifecycle() {
        let mut res = Resource::new("x", "x", "x");
        res.set_observer(CountingObserver {
            fire: true,
            registered: 0,
            deregistered: 0,
        });
        assert!(!res.check_trigger()); // not yet observed

        let mut req = Message::new();
        req.set_token(Token::new(b"tk"));
        res.set_observed(true, Some(&req));
        assert!(res.observed());
        assert_eq!(res.obs_token(), Token::new(b"tk"));
        assert!(res.check_trigger());

        // serials count up from 2
        assert_eq!(res.next_serial(), 2);
        assert_eq!(res.next_serial(), 3);

        res.set_observed(false, None);
        assert!(!res.observed());
        assert!(!res.check_trigger());

        // re-registration restarts the serial
        res.set_observed(true, Some(&req));
        assert_eq!(res.next_serial(), 2);
    }
}
