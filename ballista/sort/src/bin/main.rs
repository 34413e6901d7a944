// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Ballista external sort binary: sorts the lines of a file or stdin.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::{env, result};

use ballista_sort::config::{LogRotationPolicy, SortConfig, parse_compression};
use ballista_sort::error::{Result, SortError};
use ballista_sort::key::{BytesComparator, BytesPrefixKeyComputer};
use ballista_sort::row::BytesSerializer;
use ballista_sort::sorter::ExternalSorter;
use clap::Parser;
use futures::TryStreamExt;
use tracing_subscriber::EnvFilter;

#[derive(clap::Parser, Debug)]
#[command(version, about, long_about = None)]
struct Config {
    #[arg(long, help = "File to sort. Default: stdin")]
    input: Option<PathBuf>,
    #[arg(long, help = "File to write the sorted lines to. Default: stdout")]
    output: Option<PathBuf>,
    #[arg(
        long,
        default_value_t = 4 * 1024 * 1024,
        help = "Memory allocated up front, in bytes. Default: 4MB"
    )]
    reserved_memory: usize,
    #[arg(
        long,
        default_value_t = 64 * 1024 * 1024,
        help = "Most memory the sort may hold, in bytes. Default: 64MB"
    )]
    max_memory: usize,
    #[arg(
        long,
        default_value_t = 1024 * 1024,
        help = "Growth step of a sort buffer, in bytes. Default: 1MB"
    )]
    per_request_memory: usize,
    #[arg(
        long,
        default_value_t = 32 * 1024,
        help = "Size of a memory segment, in bytes. Default: 32KB"
    )]
    segment_size: usize,
    #[arg(
        long,
        default_value_t = 2,
        help = "Number of sort buffers sharing the memory budget. Default: 2"
    )]
    num_sort_buffers: usize,
    #[arg(
        long,
        default_value_t = 128,
        help = "Most runs merged in one pass. Default: 128"
    )]
    max_fan_in: usize,
    #[arg(
        long,
        default_value_t = 4096,
        help = "Lines per batch in a spill file. Default: 4096"
    )]
    spill_batch_rows: usize,
    #[arg(
        long,
        default_value_t = String::from("lz4_frame"),
        help = "Spill file compression, possible values: none, lz4_frame, zstd. Default: lz4_frame"
    )]
    spill_compression: String,
    #[arg(long, help = "Directory for spill files. Default: the system temp dir")]
    spill_dir: Option<PathBuf>,
    #[arg(
        long,
        default_value_t = 8,
        help = "Leading bytes of each line compared without the full comparator. Default: 8"
    )]
    key_prefix_len: usize,
    #[arg(
        long,
        help = "Log dir: a path to save log. This will create a new storage directory at the specified path if it does not already exist."
    )]
    log_dir: Option<String>,
    #[arg(
        long,
        default_value_t = false,
        help = "Enable print thread ids and names in log file."
    )]
    print_thread_info: bool,
    #[arg(
        long,
        default_value_t = String::from("INFO"),
        help = "special log level for sub mod. For example we want whole level is INFO but ballista_sort is DEBUG: INFO,ballista_sort=DEBUG"
    )]
    log_level_setting: String,
    #[arg(
        long,
        value_enum,
        default_value_t = LogRotationPolicy::Daily,
        help = "Tracing log rotation policy, possible values: minutely, hourly, daily, never. Default: daily"
    )]
    log_rotation_policy: LogRotationPolicy,
}

impl TryFrom<&Config> for SortConfig {
    type Error = SortError;

    fn try_from(opt: &Config) -> result::Result<Self, Self::Error> {
        let mut config = SortConfig::new(
            opt.reserved_memory,
            opt.max_memory,
            opt.per_request_memory,
        )
        .with_segment_size(opt.segment_size)
        .with_num_sort_buffers(opt.num_sort_buffers)
        .with_max_fan_in(opt.max_fan_in)
        .with_spill_batch_rows(opt.spill_batch_rows)
        .with_spill_compression(parse_compression(&opt.spill_compression)?);
        if let Some(dir) = &opt.spill_dir {
            config = config.with_spill_dir(dir);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Runtime for the sort pipeline. Input and output are plain blocking I/O, so
/// only the timer driver is enabled.
fn build_runtime() -> io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
}

fn main() -> Result<()> {
    let runtime = build_runtime()?;
    runtime.block_on(inner())
}

async fn inner() -> Result<()> {
    // parse options
    let opt = Config::parse();

    let rust_log = env::var(EnvFilter::DEFAULT_ENV);
    let log_filter = EnvFilter::new(rust_log.unwrap_or(opt.log_level_setting.clone()));

    // sorted lines go to stdout
    let tracing = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_thread_names(opt.print_thread_info)
        .with_thread_ids(opt.print_thread_info)
        .with_writer(io::stderr)
        .with_env_filter(log_filter);

    // File layer
    if let Some(log_dir) = &opt.log_dir {
        let log_file_name_prefix = "ballista-sort";

        let log_file = match opt.log_rotation_policy {
            LogRotationPolicy::Minutely => {
                tracing_appender::rolling::minutely(log_dir, log_file_name_prefix)
            }
            LogRotationPolicy::Hourly => {
                tracing_appender::rolling::hourly(log_dir, log_file_name_prefix)
            }
            LogRotationPolicy::Daily => {
                tracing_appender::rolling::daily(log_dir, log_file_name_prefix)
            }
            LogRotationPolicy::Never => {
                tracing_appender::rolling::never(log_dir, log_file_name_prefix)
            }
        };

        tracing.with_writer(log_file).init();
    } else {
        tracing.init();
    }

    let config = SortConfig::try_from(&opt)?;
    let mut sorter = ExternalSorter::try_new(
        config,
        Arc::new(BytesSerializer),
        Arc::new(BytesPrefixKeyComputer::new(opt.key_prefix_len)),
        Arc::new(BytesComparator),
    )?;

    let result = sort_lines(&mut sorter, &opt).await;
    // release memory and spill files whatever the outcome
    let closed = sorter.close().await;
    let lines = result?;
    closed?;

    tracing::info!(
        "Sorted {lines} lines, {} runs spilled ({} bytes)",
        sorter.spilled_run_count(),
        sorter.spilled_bytes()
    );
    Ok(())
}

async fn sort_lines(sorter: &mut ExternalSorter<Vec<u8>>, opt: &Config) -> Result<u64> {
    let input: Box<dyn BufRead> = match &opt.input {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let mut output: Box<dyn Write> = match &opt.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    sorter.start()?;
    for line in input.split(b'\n') {
        let mut line = line?;
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        sorter.write(&line).await?;
    }
    sorter.end_input().await?;

    let mut lines = 0;
    let mut sorted = sorter.sorted_stream().await?;
    while let Some(line) = sorted.try_next().await? {
        output.write_all(&line)?;
        output.write_all(b"\n")?;
        lines += 1;
    }
    output.flush()?;
    Ok(lines)
}
