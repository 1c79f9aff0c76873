//! Read-only snapshot of the disks physically present on the node.

/// State of one backing partition at handler construction time.
#[derive(Clone, Debug)]
pub struct PartitionState {
    pub up: bool,
    pub reason: String,
}

impl PartitionState {
    pub fn up() -> Self {
        PartitionState {
            up: true,
            reason: String::new(),
        }
    }

    pub fn down(reason: impl Into<String>) -> Self {
        PartitionState {
            up: false,
            reason: reason.into(),
        }
    }
}

/// One entry per disk index. Down partitions still occupy a slot so disk
/// indices stay stable.
#[derive(Clone, Debug, Default)]
pub struct PartitionStateList {
    partitions: Vec<PartitionState>,
}

impl PartitionStateList {
    pub fn new(partitions: Vec<PartitionState>) -> Self {
        PartitionStateList { partitions }
    }

    /// Convenience for the common all-disks-healthy case.
    pub fn all_up(count: usize) -> Self {
        PartitionStateList {
            partitions: (0..count).map(|_| PartitionState::up()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn get(&self, disk: usize) -> &PartitionState {
        &self.partitions[disk]
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionState> {
        self.partitions.iter()
    }
}
