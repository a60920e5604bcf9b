// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::pin::Pin;

use crate::network::Request;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Business logic bound to one message id.
///
/// The router always runs `pre_handle`, `handle` and `post_handle` in that order, so
/// cross cutting concerns (auth, metrics, logging) can live in the outer two phases.
/// Every phase defaults to a no-op.
///
/// There is no timeout around a handler: one that never completes occupies its task, or
/// its worker when the worker pool is enabled, for good.
pub trait Handler: Send + Sync + 'static {
    fn pre_handle<'a>(&'a self, _request: &'a Request) -> HandlerFuture<'a> {
        Box::pin(async {})
    }

    fn handle<'a>(&'a self, _request: &'a Request) -> HandlerFuture<'a> {
        Box::pin(async {})
    }

    fn post_handle<'a>(&'a self, _request: &'a Request) -> HandlerFuture<'a> {
        Box::pin(async {})
    }
}

/// Absorbs requests for message ids nobody registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseHandler;

impl Handler for BaseHandler {}
