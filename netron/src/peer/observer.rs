use std::cell::RefCell;
use std::rc::Rc;

use super::Status;
use crate::definition::Definition;

type StatusObserver = Rc<dyn Fn(Status)>;
type StreamObserver = Rc<dyn Fn(u64)>;
type AttachObserver = Rc<dyn Fn(&str, &Definition)>;
type DetachObserver = Rc<dyn Fn(&str)>;

/// Registered event callbacks of a peer.
///
/// Callbacks run after the state change they report, on a snapshot of the
/// list, so a callback may register further callbacks.
#[derive(Default)]
pub(crate) struct Observers {
    status: RefCell<Vec<StatusObserver>>,
    stream_request: RefCell<Vec<StreamObserver>>,
    context_attach: RefCell<Vec<AttachObserver>>,
    context_detach: RefCell<Vec<DetachObserver>>,
}

impl Observers {
    pub(crate) fn add_status(&self, observer: StatusObserver) {
        self.status.borrow_mut().push(observer);
    }

    pub(crate) fn add_stream_request(&self, observer: StreamObserver) {
        self.stream_request.borrow_mut().push(observer);
    }

    pub(crate) fn add_context_attach(&self, observer: AttachObserver) {
        self.context_attach.borrow_mut().push(observer);
    }

    pub(crate) fn add_context_detach(&self, observer: DetachObserver) {
        self.context_detach.borrow_mut().push(observer);
    }

    pub(crate) fn status_changed(&self, status: Status) {
        let observers = self.status.borrow().clone();
        for observer in observers {
            observer(status);
        }
    }

    pub(crate) fn stream_requested(&self, remote_id: u64) {
        let observers = self.stream_request.borrow().clone();
        for observer in observers {
            observer(remote_id);
        }
    }

    pub(crate) fn context_attached(&self, ctx_id: &str, definition: &Definition) {
        let observers = self.context_attach.borrow().clone();
        for observer in observers {
            observer(ctx_id, definition);
        }
    }

    pub(crate) fn context_detached(&self, ctx_id: &str) {
        let observers = self.context_detach.borrow().clone();
        for observer in observers {
            observer(ctx_id);
        }
    }
}
