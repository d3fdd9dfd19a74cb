/// A staged seek that redirects the next resume of a partition.
///
/// At most one is held per partition; a later `stage` overwrites an earlier one and
/// `take` hands it out exactly once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeekOverride {
    target_offset: Option<i64>,
}

impl SeekOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, offset: i64) {
        self.target_offset = Some(offset);
    }

    pub fn target(&self) -> Option<i64> {
        self.target_offset
    }

    pub fn take(&mut self) -> Option<i64> {
        self.target_offset.take()
    }
}
