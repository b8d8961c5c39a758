//! Local sorter and writer.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;
use std::path::Path;

use log;
use rayon::slice::ParallelSliceMut;

use crate::buffer::RecordBuffer;
use crate::record::Record;

/// Sorting error. Always fatal to a run.
#[derive(Debug)]
pub enum SortError {
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Output could not be written or persisted.
    IO(io::Error),
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            SortError::ThreadPoolBuildError(err) => err,
            SortError::IO(err) => err,
        })
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
        }
    }
}

impl From<io::Error> for SortError {
    fn from(err: io::Error) -> Self {
        SortError::IO(err)
    }
}

/// Local sorter builder. Provides methods for [`LocalSorter`] initialization.
#[derive(Debug, Clone, Default)]
pub struct LocalSorterBuilder {
    /// Number of threads to be used to sort data in parallel.
    threads_number: Option<usize>,
    /// Output write buffer size.
    rw_buf_size: Option<usize>,
}

impl LocalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        LocalSorterBuilder::default()
    }

    /// Builds a [`LocalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<LocalSorter, SortError> {
        LocalSorter::new(self.threads_number, self.rw_buf_size)
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> LocalSorterBuilder {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets output write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> LocalSorterBuilder {
        self.rw_buf_size = Some(buf_size);
        return self;
    }
}

/// Orders the records a node owns by key and persists them.
pub struct LocalSorter {
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Output write buffer size.
    rw_buf_size: Option<usize>,
}

impl LocalSorter {
    /// Creates a new local sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort data in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `rw_buf_size` - Output write buffer size.
    pub fn new(threads_number: Option<usize>, rw_buf_size: Option<usize>) -> Result<Self, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(LocalSorter {
            thread_pool,
            rw_buf_size,
        });
    }

    /// Orders records by ascending key bytes. Relative order of equal keys is unspecified.
    pub fn sort(&self, mut buffer: RecordBuffer) -> Vec<Record> {
        log::debug!("sorting {} records ...", buffer.len());
        self.thread_pool.install(|| {
            buffer.par_sort_unstable_by(|a, b| a.cmp_key(b));
        });

        buffer.into_vec()
    }

    /// Writes records back to back, each exactly as received, and flushes the writer.
    pub fn write<W: Write>(&self, records: &[Record], writer: W) -> Result<(), SortError> {
        let mut writer = match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, writer),
            None => io::BufWriter::new(writer),
        };

        for record in records {
            writer.write_all(record.as_bytes())?;
        }
        writer.flush()?;

        return Ok(());
    }

    /// Writes records to `path`.
    ///
    /// Data goes to a temporary file next to `path`, renamed into place once completely written.
    pub fn write_to_path(&self, records: &[Record], path: &Path) -> Result<(), SortError> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let mut tmp_file = tempfile::NamedTempFile::new_in(dir)?;
        self.write(records, tmp_file.as_file_mut())?;
        tmp_file.as_file().sync_all()?;
        tmp_file.persist(path).map_err(|err| SortError::IO(err.error))?;

        log::info!("{} records written to {}", records.len(), path.display());

        return Ok(());
    }
}
