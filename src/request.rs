//! Queued user requests and their typed completion handles.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{BillSecurityLevel, CashType, DeviceInfo};

/// Caller-side handle for the result of a queued request.
///
/// The operate thread fulfills the handle between poll cycles; the caller
/// blocks on [`wait`](Self::wait) (or bounds the wait with
/// [`wait_timeout`](Self::wait_timeout)).
pub struct Reply<T>(mpsc::Receiver<Result<T>>);

impl<T> Reply<T> {
    /// Blocks until the operate thread fulfills the request.
    pub fn wait(self) -> Result<T> {
        self.0.recv().unwrap_or(Err(Error::Stopped))
    }

    /// Blocks until the request is fulfilled or `timeout` elapses.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.0.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::Stopped),
        }
    }
}

/// Worker-side half of a [`Reply`].
pub(crate) struct Responder<T>(mpsc::SyncSender<Result<T>>);

impl<T> Responder<T> {
    /// Completes the paired [`Reply`]. A caller that already dropped its
    /// handle is ignored.
    pub(crate) fn fulfill(self, result: Result<T>) {
        let _ = self.0.send(result);
    }
}

pub(crate) fn channel<T>() -> (Responder<T>, Reply<T>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (Responder(tx), Reply(rx))
}

/// A user request held in the queue together with its completion handle.
///
/// Each variant carries its own typed [`Responder`]; there is no erased
/// storage to cast back per request kind.
pub(crate) enum Request {
    GetDeviceInfo(Responder<DeviceInfo>),
    GetCashTypes(Responder<BTreeSet<CashType>>),
    GetEnabledCashTypes(Responder<BTreeSet<CashType>>),
    SetEnabledCashTypes(BTreeSet<CashType>, Responder<()>),
    GetSecurityLevels(Responder<BTreeMap<CashType, BillSecurityLevel>>),
    SetSecurityLevels(BTreeMap<CashType, BillSecurityLevel>, Responder<()>),
}

impl Request {
    /// Fails the request without servicing it; used when the driver stops
    /// before the queue drains.
    pub(crate) fn cancel(self) {
        match self {
            Self::GetDeviceInfo(responder) => responder.fulfill(Err(Error::Stopped)),
            Self::GetCashTypes(responder) => responder.fulfill(Err(Error::Stopped)),
            Self::GetEnabledCashTypes(responder) => responder.fulfill(Err(Error::Stopped)),
            Self::SetEnabledCashTypes(_, responder) => responder.fulfill(Err(Error::Stopped)),
            Self::GetSecurityLevels(responder) => responder.fulfill(Err(Error::Stopped)),
            Self::SetSecurityLevels(_, responder) => responder.fulfill(Err(Error::Stopped)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fulfilled_reply_yields_the_value() {
        let (responder, reply) = channel();
        responder.fulfill(Ok(7u32));
        assert_eq!(reply.wait().unwrap(), 7);
    }

    #[test]
    fn dropped_responder_reports_stopped() {
        let (responder, reply) = channel::<u32>();
        drop(responder);
        assert!(matches!(reply.wait(), Err(Error::Stopped)));
    }

    #[test]
    fn wait_timeout_reports_timeout() {
        let (_responder, reply) = channel::<u32>();
        assert!(matches!(
            reply.wait_timeout(Duration::from_millis(10)),
            Err(Error::Timeout)
        ));
    }
}
