//! Durable state: binlog, per-namespace data store, meta files

pub mod binlog;
pub mod meta;
pub mod store;

pub use binlog::{BinLogger, LogEntry, LogOp};
pub use meta::Meta;
pub use store::DataStore;

use rocksdb::{BlockBasedOptions, DBCompressionType, Options};

/// RocksDB options honoring the compression / block-size / write-buffer knobs
pub(crate) fn db_options(compress: bool, block_size_kb: usize, write_buffer_mb: usize) -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_compression_type(if compress {
        DBCompressionType::Snappy
    } else {
        DBCompressionType::None
    });
    opts.set_write_buffer_size(write_buffer_mb * 1024 * 1024);
    let mut block_opts = BlockBasedOptions::default();
    block_opts.set_block_size(block_size_kb * 1024);
    opts.set_block_based_table_factory(&block_opts);
    opts
}
