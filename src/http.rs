// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The byte-range HTTP fetcher contract the download action consumes.
//!
//! A transfer is a stream of [`FetchEvent`]s mirroring the four delegate
//! signals: received bytes, a server-directed seek, completion (with
//! success flag), and termination. Pause parks the stream between range
//! requests so no connection is held open while suspended.

use futures::stream::LocalBoxStream;
use futures::task::Waker;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchEvent {
    /// The server redirected the transfer to a different offset; the
    /// consumer must restart its bookkeeping from there.
    SeekTo(u64),
    Data(Vec<u8>),
    Complete { successful: bool },
    Terminated,
}

impl FetchEvent {
    pub fn ends_transfer(&self) -> bool {
        matches!(self, FetchEvent::Complete { .. } | FetchEvent::Terminated)
    }
}

pub trait HttpFetcher {
    /// Starts a transfer of `length` bytes (or to EOF) from `offset`.
    /// Only one transfer may be active per fetcher.
    fn begin_transfer(
        &mut self,
        url: Url,
        offset: u64,
        length: Option<u64>,
    ) -> LocalBoxStream<'static, FetchEvent>;

    fn pause(&mut self);

    fn resume(&mut self);

    /// Prompt cancellation; the stream ends with `Terminated`.
    fn terminate(&mut self);

    fn http_response_code(&self) -> Option<u16>;
}

#[derive(Debug, Default)]
struct FetchControl {
    paused: bool,
    terminated: bool,
    waker: Option<Waker>,
}

#[derive(Clone, Debug, Default)]
struct ControlHandle(Rc<RefCell<FetchControl>>);

impl ControlHandle {
    fn set_paused(&self, paused: bool) {
        let mut inner = self.0.borrow_mut();
        inner.paused = paused;
        if !paused {
            if let Some(waker) = inner.waker.take() {
                waker.wake();
            }
        }
    }

    fn terminate(&self) {
        let mut inner = self.0.borrow_mut();
        inner.terminated = true;
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    fn is_terminated(&self) -> bool {
        self.0.borrow().terminated
    }

    /// Resolves once not paused (or terminated).
    async fn wait_resumed(&self) {
        futures::future::poll_fn(|cx| {
            let mut inner = self.0.borrow_mut();
            if !inner.paused || inner.terminated {
                std::task::Poll::Ready(())
            } else {
                inner.waker = Some(cx.waker().clone());
                std::task::Poll::Pending
            }
        })
        .await
    }
}

/// Ranged-GET fetcher over hyper + rustls. Bytes are pulled one range at
/// a time; each range is collected whole under a timeout, so a suspended
/// transfer holds no socket.
pub struct HyperFetcher {
    client: hyper::Client<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>,
    range_size: u64,
    range_timeout: Duration,
    control: ControlHandle,
    response_code: Rc<Cell<Option<u16>>>,
}

impl HyperFetcher {
    pub fn new() -> Self {
        Self::with_range(1024 * 1024, Duration::from_secs(30))
    }

    pub fn with_range(range_size: u64, range_timeout: Duration) -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_all_versions()
            .build();
        HyperFetcher {
            client: hyper::Client::builder().build(https),
            range_size,
            range_timeout,
            control: ControlHandle::default(),
            response_code: Rc::new(Cell::new(None)),
        }
    }
}

impl Default for HyperFetcher {
    fn default() -> Self {
        Self::new()
    }
}

struct RangeState {
    url: Url,
    offset: u64,
    /// Exclusive end of the requested window, if bounded.
    end: Option<u64>,
}

impl HttpFetcher for HyperFetcher {
    fn begin_transfer(
        &mut self,
        url: Url,
        offset: u64,
        length: Option<u64>,
    ) -> LocalBoxStream<'static, FetchEvent> {
        self.control = ControlHandle::default();
        self.response_code.set(None);

        let control = self.control.clone();
        let response_code = self.response_code.clone();
        let client = self.client.clone();
        let range_size = self.range_size;
        let range_timeout = self.range_timeout;
        let state = RangeState {
            url,
            offset,
            end: length.map(|l| offset + l),
        };

        Box::pin(futures::stream::unfold(
            (state, VecDeque::<FetchEvent>::new(), false),
            move |(mut state, mut pending, mut done)| {
                let control = control.clone();
                let response_code = response_code.clone();
                let client = client.clone();
                async move {
                    loop {
                        if let Some(event) = pending.pop_front() {
                            done = done || event.ends_transfer();
                            return Some((event, (state, pending, done)));
                        }
                        if done {
                            return None;
                        }
                        control.wait_resumed().await;
                        if control.is_terminated() {
                            pending.push_back(FetchEvent::Terminated);
                            continue;
                        }
                        if state.end == Some(state.offset) {
                            pending.push_back(FetchEvent::Complete { successful: true });
                            continue;
                        }

                        let range_end = match state.end {
                            Some(end) => end.min(state.offset + range_size),
                            None => state.offset + range_size,
                        };
                        let request = hyper::Request::get(state.url.as_str())
                            .header(
                                hyper::header::RANGE,
                                format!("bytes={}-{}", state.offset, range_end - 1),
                            )
                            .body(hyper::Body::empty());
                        let request = match request {
                            Ok(r) => r,
                            Err(_) => {
                                pending.push_back(FetchEvent::Complete { successful: false });
                                continue;
                            }
                        };

                        let response = tokio::time::timeout(
                            range_timeout,
                            collect_response(&client, request),
                        )
                        .await;
                        match response {
                            Ok(Ok((status, body))) => {
                                response_code.set(Some(status));
                                match status {
                                    206 | 200 => {
                                        if status == 200 && state.offset != 0 {
                                            // Server ignored the range; start
                                            // over from byte zero.
                                            state.offset = 0;
                                            pending.push_back(FetchEvent::SeekTo(0));
                                        }
                                        let len = body.len() as u64;
                                        let exhausted =
                                            len < range_end - state.offset || status == 200;
                                        state.offset += len;
                                        if !body.is_empty() {
                                            pending.push_back(FetchEvent::Data(body));
                                        }
                                        if exhausted {
                                            pending.push_back(FetchEvent::Complete {
                                                successful: true,
                                            });
                                        }
                                    }
                                    416 => {
                                        // Past EOF: everything requested has
                                        // been delivered.
                                        pending.push_back(FetchEvent::Complete {
                                            successful: true,
                                        });
                                    }
                                    code => {
                                        warn!(code, "http transfer failed");
                                        pending.push_back(FetchEvent::Complete {
                                            successful: false,
                                        });
                                    }
                                }
                            }
                            Ok(Err(e)) => {
                                debug!("http transfer error: {e}");
                                pending.push_back(FetchEvent::Complete { successful: false });
                            }
                            Err(_) => {
                                warn!("http range request timed out");
                                pending.push_back(FetchEvent::Complete { successful: false });
                            }
                        }
                    }
                }
            },
        ))
    }

    fn pause(&mut self) {
        self.control.set_paused(true);
    }

    fn resume(&mut self) {
        self.control.set_paused(false);
    }

    fn terminate(&mut self) {
        self.control.terminate();
    }

    fn http_response_code(&self) -> Option<u16> {
        self.response_code.get()
    }
}

async fn collect_response(
    client: &hyper::Client<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>,
    request: hyper::Request<hyper::Body>,
) -> Result<(u16, Vec<u8>), hyper::Error> {
    let response = client.request(request).await?;
    let status = response.status().as_u16();
    let body = hyper::body::to_bytes(response.into_body()).await?;
    Ok((status, body.to_vec()))
}

/// Scripted fetcher for tests. Each `begin_transfer` call consumes the
/// next script entry; requested URLs and offsets are recorded.
#[derive(Clone, Default)]
pub struct MockHttpFetcher {
    scripts: Rc<RefCell<VecDeque<Vec<FetchEvent>>>>,
    requests: Rc<RefCell<Vec<(Url, u64)>>>,
    control: ControlHandle,
    response_code: Rc<Cell<Option<u16>>>,
}

impl MockHttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the events one transfer will yield.
    pub fn push_transfer(&self, events: Vec<FetchEvent>) {
        self.scripts.borrow_mut().push_back(events);
    }

    /// Convenience: a successful transfer delivering `bytes` in `chunks`
    /// roughly equal windows.
    pub fn push_success(&self, bytes: &[u8], chunks: usize) {
        let mut events = Vec::new();
        let chunk_len = bytes.len().div_ceil(chunks.max(1)).max(1);
        for chunk in bytes.chunks(chunk_len) {
            events.push(FetchEvent::Data(chunk.to_vec()));
        }
        events.push(FetchEvent::Complete { successful: true });
        self.push_transfer(events);
    }

    pub fn set_response_code(&self, code: u16) {
        self.response_code.set(Some(code));
    }

    pub fn requests(&self) -> Vec<(Url, u64)> {
        self.requests.borrow().clone()
    }
}

impl HttpFetcher for MockHttpFetcher {
    fn begin_transfer(
        &mut self,
        url: Url,
        offset: u64,
        _length: Option<u64>,
    ) -> LocalBoxStream<'static, FetchEvent> {
        self.requests.borrow_mut().push((url, offset));
        self.control = ControlHandle::default();
        let script: VecDeque<FetchEvent> = self
            .scripts
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| vec![FetchEvent::Complete { successful: false }])
            .into();
        let control = self.control.clone();

        Box::pin(futures::stream::unfold(
            (script, false),
            move |(mut script, done)| {
                let control = control.clone();
                async move {
                    if done {
                        return None;
                    }
                    control.wait_resumed().await;
                    if control.is_terminated() {
                        return Some((FetchEvent::Terminated, (script, true)));
                    }
                    let event = script.pop_front()?;
                    let ends = event.ends_transfer();
                    Some((event, (script, ends)))
                }
            },
        ))
    }

    fn pause(&mut self) {
        self.control.set_paused(true);
    }

    fn resume(&mut self) {
        self.control.set_paused(false);
    }

    fn terminate(&mut self) {
        self.control.terminate();
    }

    fn http_response_code(&self) -> Option<u16> {
        self.response_code.get()
    }
}
