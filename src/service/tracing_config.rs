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

use std::path::Path;

use dotenv::dotenv;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::{AppError, AppResult};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Console only tracing, used by tests and the demo client.
///
/// Installing twice is not an error, the first subscriber wins.
pub fn setup_local_tracing() -> AppResult<()> {
    // load .env if present
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter("info"))
        .try_init();
    Ok(())
}

/// Console tracing plus, when `log_file` is set, a non-blocking copy into that file.
///
/// The returned guard must be kept alive for the file writer to flush.
pub fn setup_tracing(log_file: Option<&str>, default_level: &str) -> AppResult<Option<WorkerGuard>> {
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());

    let Some(log_file) = log_file.filter(|name| !name.is_empty()) else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_timer(timer)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);
        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(env_filter(default_level))
            .try_init()
            .map_err(|e| AppError::IllegalStateError(format!("tracing init: {}", e)))?;
        return Ok(None);
    };

    let path = Path::new(log_file);
    let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| AppError::InvalidValue(format!("log file name: {}", log_file)))?;
    let file_appender = tracing_appender::rolling::never(directory, file_name);

    // file writer off the hot path, console copy alongside
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
    let writer = non_blocking.and(std::io::stdout);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(default_level))
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("tracing init: {}", e)))?;

    Ok(Some(worker_guard))
}
