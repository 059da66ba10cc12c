use std::os::raw::c_uint;

/// Cursor positioning operations, numbered as the engine expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    First,
    FirstDup,
    GetBoth,
    GetBothRange,
    GetCurrent,
    Last,
    LastDup,
    Next,
    NextDup,
    NextNoDup,
    Prev,
    PrevDup,
    PrevNoDup,
    Set,
    SetKey,
    SetRange,
}

impl CursorOp {
    pub(crate) fn to_raw(self) -> c_uint {
        match self {
            CursorOp::First => 0,
            CursorOp::FirstDup => 1,
            CursorOp::GetBoth => 2,
            CursorOp::GetBothRange => 3,
            CursorOp::GetCurrent => 4,
            CursorOp::Last => 6,
            CursorOp::LastDup => 7,
            CursorOp::Next => 8,
            CursorOp::NextDup => 9,
            CursorOp::NextNoDup => 11,
            CursorOp::Prev => 12,
            CursorOp::PrevDup => 13,
            CursorOp::PrevNoDup => 14,
            CursorOp::Set => 15,
            CursorOp::SetKey => 16,
            CursorOp::SetRange => 17,
        }
    }
}

/// B-tree statistics for an environment or a single database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub page_size: u32,
    pub depth: u32,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
    pub entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    pub map_size: usize,
    pub last_page: usize,
    pub last_txn_id: usize,
    pub max_readers: u32,
    pub num_readers: u32,
}

/// Version of the linked engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
}
