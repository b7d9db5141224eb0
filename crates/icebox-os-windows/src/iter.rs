use icebox_core::{Channel, Reader, Va, VmError};

use crate::WindowsError;

/// Longest list the walkers will follow before declaring corruption.
const MAX_LIST_ENTRIES: usize = 1 << 20;

/// Walks a `LIST_ENTRY` ring starting (and ending) at `head`.
///
/// The callback receives the address of each `LIST_ENTRY` embedded in its
/// containing structure and returns `false` to stop early. A ring that does
/// not close within a sane bound fails as corruption.
pub(crate) fn walk_list<C>(
    reader: &Reader<'_, C>,
    head: Va,
    flink: u64,
    mut callback: impl FnMut(Va) -> Result<bool, VmError>,
) -> Result<(), VmError>
where
    C: Channel,
{
    let mut entry = reader.read_ptr(head + flink)?;

    for _ in 0..MAX_LIST_ENTRIES {
        if entry == head || entry.is_null() {
            return Ok(());
        }

        if !callback(entry)? {
            return Ok(());
        }

        entry = reader.read_ptr(entry + flink)?;
    }

    Err(WindowsError::CorruptProcessList(head).into())
}
