use anyhow::Result;
use std::fmt::Debug;
use tokio::sync::oneshot;

/// A payload on its way to the request loop, carrying the channel its answer
/// goes back on. Every answer is an `anyhow::Result` so the loop can forward
/// catalog, runner and lookup errors alike.
pub struct Request<P, T> {
    pub payload: P,
    pub reply_to: oneshot::Sender<Result<T>>,
}

impl<P: Debug, T> Debug for Request<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Request").field(&self.payload).finish()
    }
}

impl<P, T> Request<P, T> {
    pub fn new(payload: P) -> (Self, oneshot::Receiver<Result<T>>) {
        let (reply_to, rx) = oneshot::channel();
        (Self { payload, reply_to }, rx)
    }
}

/// Declares the request enum with one variant per `Payload -> Answer` pair,
/// plus the `From` conversions [`crate::orchestrator::call`] relies on.
macro_rules! requests {
    ($name:ident { $($variant:ident($payload:ty) -> $answer:ty),* $(,)? }) => {
        #[derive(Debug)]
        pub enum $name {
            $($variant($crate::request::Request<$payload, $answer>),)*
        }

        $(
            impl From<$crate::request::Request<$payload, $answer>> for $name {
                fn from(request: $crate::request::Request<$payload, $answer>) -> Self {
                    $name::$variant(request)
                }
            }
        )*
    };
}

pub(crate) use requests;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answer_travels_back_to_the_caller() {
        let (request, rx) = Request::<u32, String>::new(7);
        assert_eq!(format!("{request:?}"), "Request(7)");

        let Request { payload, reply_to } = request;
        reply_to.send(Ok(payload.to_string())).unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), "7");
    }

    #[tokio::test]
    async fn dropped_request_closes_the_reply_channel() {
        let (request, rx) = Request::<u32, String>::new(7);
        drop(request);
        assert!(rx.await.is_err());
    }
}
