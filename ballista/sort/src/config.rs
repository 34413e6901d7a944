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

//! Configuration for the external sort engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::result;
use std::sync::LazyLock;

use arrow::datatypes::DataType;
use arrow::ipc::CompressionType;

use crate::error::{Result, SortError};

/// memory the sort is guaranteed to hold from the start, in bytes
pub const BALLISTA_SORT_RESERVED_MEMORY: &str = "ballista.sort.reserved_memory";
/// ceiling on the memory the sort will ever hold, in bytes
pub const BALLISTA_SORT_MAX_MEMORY: &str = "ballista.sort.max_memory";
/// unit in which a sort buffer grows, in bytes
pub const BALLISTA_SORT_PER_REQUEST_MEMORY: &str = "ballista.sort.per_request_memory";
pub const BALLISTA_SORT_SEGMENT_SIZE: &str = "ballista.sort.segment_size";
pub const BALLISTA_SORT_NUM_SORT_BUFFERS: &str = "ballista.sort.num_sort_buffers";
/// maximum number of runs merged at once before intermediate passes kick in
pub const BALLISTA_SORT_MAX_FAN_IN: &str = "ballista.sort.max_fan_in";
pub const BALLISTA_SORT_SPILL_BATCH_ROWS: &str = "ballista.sort.spill_batch_rows";
/// one of `none`, `lz4_frame`, `zstd`
pub const BALLISTA_SORT_SPILL_COMPRESSION: &str = "ballista.sort.spill_compression";
pub const BALLISTA_SORT_SPILL_DIR: &str = "ballista.sort.spill_dir";

pub type ParseResult<T> = result::Result<T, String>;

/// Largest sort buffer addressable by the 32 bit record pointers.
pub const MAX_SORT_BUFFER_BYTES: usize = u32::MAX as usize;

const DEFAULT_SEGMENT_SIZE: usize = 32 * 1024;

static CONFIG_ENTRIES: LazyLock<HashMap<String, ConfigEntry>> = LazyLock::new(|| {
    let entries = vec![
        ConfigEntry::new(BALLISTA_SORT_RESERVED_MEMORY.to_string(),
                         "Memory in bytes reserved for the sort when it starts".to_string(),
                         DataType::UInt64,
                         Some((4 * 1024 * 1024).to_string())),
        ConfigEntry::new(BALLISTA_SORT_MAX_MEMORY.to_string(),
                         "Maximum memory in bytes the sort may hold before spilling".to_string(),
                         DataType::UInt64,
                         Some((64 * 1024 * 1024).to_string())),
        ConfigEntry::new(BALLISTA_SORT_PER_REQUEST_MEMORY.to_string(),
                         "Memory in bytes a sort buffer requests each time it grows".to_string(),
                         DataType::UInt64,
                         Some((1024 * 1024).to_string())),
        ConfigEntry::new(BALLISTA_SORT_SEGMENT_SIZE.to_string(),
                         "Size in bytes of one memory segment".to_string(),
                         DataType::UInt64,
                         Some(DEFAULT_SEGMENT_SIZE.to_string())),
        ConfigEntry::new(BALLISTA_SORT_NUM_SORT_BUFFERS.to_string(),
                         "Number of sort buffers sharing the memory budget".to_string(),
                         DataType::UInt16,
                         Some(2.to_string())),
        ConfigEntry::new(BALLISTA_SORT_MAX_FAN_IN.to_string(),
                         "Maximum number of sorted runs merged in one pass".to_string(),
                         DataType::UInt16,
                         Some(128.to_string())),
        ConfigEntry::new(BALLISTA_SORT_SPILL_BATCH_ROWS.to_string(),
                         "Number of records per batch in a spill file".to_string(),
                         DataType::UInt32,
                         Some(4096.to_string())),
        ConfigEntry::new(BALLISTA_SORT_SPILL_COMPRESSION.to_string(),
                         "Compression codec for spill files: none, lz4_frame or zstd".to_string(),
                         DataType::Utf8,
                         Some("lz4_frame".to_string())),
        ConfigEntry::new(BALLISTA_SORT_SPILL_DIR.to_string(),
                         "Directory under which spill files are created".to_string(),
                         DataType::Utf8,
                         None),
    ];
    entries
        .into_iter()
        .map(|e| (e.name.clone(), e))
        .collect::<HashMap<_, _>>()
});

/// Configuration option meta-data
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    name: String,
    description: String,
    data_type: DataType,
    default_value: Option<String>,
}

impl ConfigEntry {
    fn new(
        name: String,
        description: String,
        data_type: DataType,
        default_value: Option<String>,
    ) -> Self {
        Self {
            name,
            description,
            data_type,
            default_value,
        }
    }

    /// Returns the setting key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the human readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the default value, if the setting has one.
    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }
}

/// Configuration for the external sort.
///
/// Controls the memory budget, how the budget is split between sort buffers,
/// merge fan-in and the format of spill files.
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Memory guaranteed to the sort at start, allocated eagerly (default: 4MB)
    pub reserved_memory: usize,
    /// Ceiling on the memory the sort will ever hold (default: 64MB)
    pub max_memory: usize,
    /// Memory requested each time a sort buffer grows (default: 1MB)
    pub per_request_memory: usize,
    /// Size of a single memory segment (default: 32KB)
    pub segment_size: usize,
    /// Number of sort buffers sharing the budget (default: 2).
    /// A single buffer never holds more than `max / num_sort_buffers`, which
    /// lets ingest keep filling one buffer while another is being spilled.
    pub num_sort_buffers: usize,
    /// Maximum number of runs merged in one pass (default: 128)
    pub max_fan_in: usize,
    /// Records per Arrow batch in a spill file (default: 4096)
    pub spill_batch_rows: usize,
    /// Compression codec for spill files (default: LZ4_FRAME)
    pub spill_compression: Option<CompressionType>,
    /// Base directory for spill files (default: the system temp dir)
    pub spill_dir: PathBuf,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            reserved_memory: 4 * 1024 * 1024,     // 4 MB
            max_memory: 64 * 1024 * 1024,         // 64 MB
            per_request_memory: 1024 * 1024,      // 1 MB
            segment_size: DEFAULT_SEGMENT_SIZE,   // 32 KB
            num_sort_buffers: 2,
            max_fan_in: 128,
            spill_batch_rows: 4096,
            spill_compression: Some(CompressionType::LZ4_FRAME),
            spill_dir: std::env::temp_dir(),
        }
    }
}

impl SortConfig {
    /// Creates a configuration with the given memory budget and defaults
    /// for everything else.
    pub fn new(reserved_memory: usize, max_memory: usize, per_request_memory: usize) -> Self {
        Self {
            reserved_memory,
            max_memory,
            per_request_memory,
            ..Default::default()
        }
    }

    /// Sets the segment size.
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Sets the number of sort buffers.
    pub fn with_num_sort_buffers(mut self, num_sort_buffers: usize) -> Self {
        self.num_sort_buffers = num_sort_buffers;
        self
    }

    /// Sets the merge fan-in.
    pub fn with_max_fan_in(mut self, max_fan_in: usize) -> Self {
        self.max_fan_in = max_fan_in;
        self
    }

    /// Sets the number of records per spill batch.
    pub fn with_spill_batch_rows(mut self, spill_batch_rows: usize) -> Self {
        self.spill_batch_rows = spill_batch_rows;
        self
    }

    /// Sets the spill compression codec, `None` writes uncompressed files.
    pub fn with_spill_compression(mut self, compression: Option<CompressionType>) -> Self {
        self.spill_compression = compression;
        self
    }

    /// Sets the base spill directory.
    pub fn with_spill_dir(mut self, spill_dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = spill_dir.into();
        self
    }

    /// Builds a configuration from `ballista.sort.*` key-value settings.
    /// Missing keys take their default, unknown keys are rejected.
    pub fn from_settings(settings: &HashMap<String, String>) -> Result<Self> {
        let entries = Self::valid_entries();
        for (name, value) in settings {
            let entry = entries.get(name).ok_or_else(|| {
                SortError::Configuration(format!(
                    "configuration key `{name}` does not exist"
                ))
            })?;
            Self::parse_value(value, &entry.data_type).map_err(|e| {
                SortError::Configuration(format!(
                    "Failed to parse user-supplied value '{value}' for configuration setting '{name}': {e}"
                ))
            })?;
        }

        let get = |key: &str| -> Option<&str> {
            settings
                .get(key)
                .map(String::as_str)
                .or_else(|| entries.get(key).and_then(|e| e.default_value()))
        };
        let get_usize = |key: &str| -> Result<usize> {
            get(key)
                .ok_or_else(|| {
                    SortError::Configuration(format!(
                        "No value specified for mandatory configuration setting '{key}'"
                    ))
                })?
                .parse::<usize>()
                .map_err(|e| SortError::Configuration(format!("{key}: {e}")))
        };

        let mut config = Self {
            reserved_memory: get_usize(BALLISTA_SORT_RESERVED_MEMORY)?,
            max_memory: get_usize(BALLISTA_SORT_MAX_MEMORY)?,
            per_request_memory: get_usize(BALLISTA_SORT_PER_REQUEST_MEMORY)?,
            segment_size: get_usize(BALLISTA_SORT_SEGMENT_SIZE)?,
            num_sort_buffers: get_usize(BALLISTA_SORT_NUM_SORT_BUFFERS)?,
            max_fan_in: get_usize(BALLISTA_SORT_MAX_FAN_IN)?,
            spill_batch_rows: get_usize(BALLISTA_SORT_SPILL_BATCH_ROWS)?,
            spill_compression: parse_compression(
                get(BALLISTA_SORT_SPILL_COMPRESSION).unwrap_or("lz4_frame"),
            )?,
            ..Default::default()
        };
        if let Some(dir) = get(BALLISTA_SORT_SPILL_DIR) {
            config.spill_dir = PathBuf::from(dir);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn parse_value(val: &str, data_type: &DataType) -> ParseResult<()> {
        match data_type {
            DataType::UInt16 => {
                val.parse::<u16>().map_err(|e| format!("{e:?}"))?;
            }
            DataType::UInt32 => {
                val.parse::<u32>().map_err(|e| format!("{e:?}"))?;
            }
            DataType::UInt64 => {
                val.parse::<usize>().map_err(|e| format!("{e:?}"))?;
            }
            DataType::Boolean => {
                val.parse::<bool>().map_err(|e| format!("{e:?}"))?;
            }
            DataType::Utf8 => {}
            _ => {
                return Err(format!("not support data type: {data_type}"));
            }
        }

        Ok(())
    }

    // All available configuration options
    pub fn valid_entries() -> &'static HashMap<String, ConfigEntry> {
        &CONFIG_ENTRIES
    }

    /// Checks that the memory budget and tuning settings are consistent.
    pub fn validate(&self) -> Result<()> {
        let config_err = |msg: String| Err(SortError::Configuration(msg));

        if self.segment_size == 0 {
            return config_err("segment size must be greater than zero".to_string());
        }
        if self.reserved_memory < self.segment_size {
            return config_err(format!(
                "reserved memory ({}) must hold at least one segment of {} bytes",
                self.reserved_memory, self.segment_size
            ));
        }
        if self.reserved_memory > self.max_memory {
            return config_err(format!(
                "reserved memory ({}) exceeds maximum memory ({})",
                self.reserved_memory, self.max_memory
            ));
        }
        if self.per_request_memory < self.segment_size {
            return config_err(format!(
                "per request memory ({}) must hold at least one segment of {} bytes",
                self.per_request_memory, self.segment_size
            ));
        }
        if self.per_request_memory > self.max_memory {
            return config_err(format!(
                "per request memory ({}) exceeds maximum memory ({})",
                self.per_request_memory, self.max_memory
            ));
        }
        if self.num_sort_buffers == 0 {
            return config_err("number of sort buffers must be at least 1".to_string());
        }
        if self.num_sort_buffers > self.max_segments() {
            return config_err(format!(
                "{} sort buffers cannot share {} segments",
                self.num_sort_buffers,
                self.max_segments()
            ));
        }
        if self.max_buffer_segments() * self.segment_size > MAX_SORT_BUFFER_BYTES {
            return config_err(format!(
                "a single sort buffer may not exceed {MAX_SORT_BUFFER_BYTES} bytes"
            ));
        }
        if self.max_fan_in < 2 {
            return config_err(format!(
                "merge fan-in must be at least 2, got {}",
                self.max_fan_in
            ));
        }
        if self.spill_batch_rows == 0 {
            return config_err("spill batch rows must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Number of segments allocated eagerly.
    pub fn reserved_segments(&self) -> usize {
        self.reserved_memory / self.segment_size
    }

    /// Number of segments the pool will ever grant.
    pub fn max_segments(&self) -> usize {
        self.max_memory / self.segment_size
    }

    /// Number of segments a sort buffer asks for when it grows.
    pub fn per_request_segments(&self) -> usize {
        self.per_request_memory / self.segment_size
    }

    /// Number of segments a single sort buffer may hold.
    pub fn max_buffer_segments(&self) -> usize {
        (self.max_segments() / self.num_sort_buffers.max(1)).max(1)
    }
}

/// Parses a spill compression codec name.
pub fn parse_compression(name: &str) -> Result<Option<CompressionType>> {
    match name.to_ascii_lowercase().as_str() {
        "none" | "uncompressed" => Ok(None),
        "lz4" | "lz4_frame" => Ok(Some(CompressionType::LZ4_FRAME)),
        "zstd" => Ok(Some(CompressionType::ZSTD)),
        other => Err(SortError::Configuration(format!(
            "unknown spill compression codec '{other}'"
        ))),
    }
}

/// Log file rolling policy of the `ballista-sort` binary.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "build-binary", derive(clap::ValueEnum))]
pub enum LogRotationPolicy {
    /// New file every minute
    Minutely,
    /// New file every hour
    Hourly,
    /// New file every day
    Daily,
    /// Single file
    #[default]
    Never,
}

#[cfg(feature = "build-binary")]
impl std::str::FromStr for LogRotationPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        clap::ValueEnum::from_str(s, true)
    }
}
