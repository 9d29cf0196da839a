use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::service::ServiceState;

/// Subscription handle for the service state.
///
/// Wraps a `watch::Receiver` so consumers can sample the current state,
/// await the next transition, or adapt it into a `Stream`.
#[derive(Debug, Clone)]
pub struct StateStream {
    rx: watch::Receiver<ServiceState>,
}

impl StateStream {
    pub(crate) fn new(rx: watch::Receiver<ServiceState>) -> Self {
        Self { rx }
    }

    /// The current state, without marking it seen.
    pub fn current(&self) -> ServiceState {
        self.rx.borrow().clone()
    }

    /// The current state, marking it seen.
    pub fn latest(&mut self) -> ServiceState {
        self.rx.borrow_and_update().clone()
    }

    /// Wait for the next transition. `None` once the service is gone.
    pub async fn changed(&mut self) -> Option<ServiceState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the state satisfies `predicate` (checked immediately).
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&ServiceState) -> bool,
    ) -> Option<ServiceState> {
        self.rx
            .wait_for(|state| predicate(state))
            .await
            .ok()
            .map(|state| state.clone())
    }

    /// Adapt into a `Stream` that yields the current state first.
    pub fn into_stream(self) -> impl Stream<Item = ServiceState> + Send + Unpin + 'static {
        WatchStream::new(self.rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt as _;

    #[tokio::test]
    async fn changed_yields_each_transition_then_none() {
        let (tx, rx) = watch::channel(ServiceState::NotStarted);
        let mut stream = StateStream::new(rx);
        assert_eq!(stream.current(), ServiceState::NotStarted);

        tx.send_replace(ServiceState::WaitingForConnection);
        assert_eq!(stream.changed().await, Some(ServiceState::WaitingForConnection));

        drop(tx);
        assert_eq!(stream.changed().await, None);
    }

    #[test]
    fn wait_for_is_pending_until_predicate_holds() {
        let (tx, rx) = watch::channel(ServiceState::NotStarted);
        let mut stream = StateStream::new(rx);
        let mut waiting =
            tokio_test::task::spawn(stream.wait_for(|s| *s == ServiceState::WaitingForConnection));
        tokio_test::assert_pending!(waiting.poll());

        tx.send_replace(ServiceState::WaitingForConnection);
        assert!(waiting.is_woken());
        let reached = tokio_test::assert_ready!(waiting.poll());
        assert_eq!(reached, Some(ServiceState::WaitingForConnection));
    }

    #[tokio::test]
    async fn into_stream_starts_with_current_state() {
        let (tx, rx) = watch::channel(ServiceState::WaitingForConnection);
        let mut states = StateStream::new(rx).into_stream();
        assert_eq!(states.next().await, Some(ServiceState::WaitingForConnection));

        tx.send_replace(ServiceState::NotStarted);
        assert_eq!(states.next().await, Some(ServiceState::NotStarted));
    }
}
