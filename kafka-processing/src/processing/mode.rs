use std::fmt;

use crate::processing::virtual_partitions::VirtualPartitioner;

/// How a partition's batches are handed to application code
#[derive(Clone, Default)]
pub enum ProcessingMode {
    /// Consume inline on the partition worker
    #[default]
    Immediate,
    /// Pause the partition and consume on a spawned task
    LongRunning,
    /// Split each batch and consume the groups concurrently
    VirtualPartitions(VirtualPartitioner),
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Immediate => "immediate",
            ProcessingMode::LongRunning => "long_running",
            ProcessingMode::VirtualPartitions(_) => "virtual_partitions",
        }
    }
}

impl fmt::Debug for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingMode::VirtualPartitions(partitioner) => f
                .debug_struct("VirtualPartitions")
                .field("max_partitions", &partitioner.max_partitions())
                .finish(),
            _ => f.write_str(self.as_str()),
        }
    }
}
