use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

pin_project_lite::pin_project! {
    /// Drives a side future (the request-body feeder) while the main
    /// future consumes the body it feeds.
    ///
    /// Resolves when the main future resolves; the side future's output is
    /// included if it completed by then. Dropping the combinator drops an
    /// unfinished side future with it, which is only done when the
    /// connection is being torn down.
    pub(crate) struct Accompany<F, A>
    where
        A: Future,
    {
        #[pin]
        main: F,
        #[pin]
        side: A,
        side_out: Option<A::Output>,
    }
}

impl<F, A: Future> Accompany<F, A> {
    pub(crate) fn new(main: F, side: A) -> Self {
        Self {
            main,
            side,
            side_out: None,
        }
    }
}

impl<F: Future, A: Future> Future for Accompany<F, A> {
    type Output = (F::Output, Option<A::Output>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if this.side_out.is_none() {
            if let Poll::Ready(out) = this.side.poll(cx) {
                *this.side_out = Some(out);
            }
        }
        match this.main.poll(cx) {
            Poll::Ready(out) => Poll::Ready((out, this.side_out.take())),
            Poll::Pending => Poll::Pending,
        }
    }
}
