//! descriptor handle 的编码：`tag | heap_id << 24 | index * increment`
//!
//! 两个后端使用相同的编码，上层只通过 `DescriptorHeapInfo` 中的起始 handle 与 increment 做偏移。

pub(crate) const CPU_HANDLE_TAG: u64 = 1 << 62;
pub(crate) const GPU_HANDLE_TAG: u64 = 1 << 61;
pub(crate) const HEAP_ID_SHIFT: u32 = 24;
pub(crate) const DESCRIPTOR_INCREMENT: u32 = 32;

#[inline]
pub(crate) fn heap_start(tag: u64, heap_id: u64) -> u64 {
    tag | (heap_id << HEAP_ID_SHIFT)
}

/// 一个 heap 的 slot 必须能放进 heap id 以下的位
#[inline]
pub(crate) fn capacity_fits(capacity: u32) -> bool {
    (capacity as u64 * DESCRIPTOR_INCREMENT as u64) < 1 << HEAP_ID_SHIFT
}

/// 解出 `(heap_id, index)`，不检查 heap 是否存在以及 index 是否越界
pub(crate) fn decode(raw: u64, tag: u64) -> Option<(u64, u32)> {
    if raw & tag == 0 {
        return None;
    }
    let untagged = raw & !tag;
    let heap_id = untagged >> HEAP_ID_SHIFT;
    let offset = untagged & ((1 << HEAP_ID_SHIFT) - 1);
    if offset % DESCRIPTOR_INCREMENT as u64 != 0 {
        return None;
    }
    Some((heap_id, (offset / DESCRIPTOR_INCREMENT as u64) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        let start = heap_start(GPU_HANDLE_TAG, 3);
        assert_eq!(decode(start + 5 * DESCRIPTOR_INCREMENT as u64, GPU_HANDLE_TAG), Some((3, 5)));
        // tag 不匹配
        assert_eq!(decode(start, CPU_HANDLE_TAG), None);
        // 没有对齐到 increment
        assert_eq!(decode(start + 1, GPU_HANDLE_TAG), None);
        assert!(capacity_fits(1024));
        assert!(!capacity_fits(1 << 19));
    }
}
