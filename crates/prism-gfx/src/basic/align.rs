use crate::error::{GfxResult, GraphicsError};

/// 将 `size` 向上取整到 `align` 的整数倍
///
/// 计算方式为 `(size + align - 1) & !(align - 1)`，要求 `align` 是 2 的幂；
/// 否则返回 [`GraphicsError::AlignmentViolation`]。
/// 结果超出 u64 范围时返回 [`GraphicsError::CapacityExceeded`]。
#[inline]
pub fn align_up(size: u64, align: u64) -> GfxResult<u64> {
    if !align.is_power_of_two() {
        return Err(GraphicsError::AlignmentViolation { align });
    }
    let padded = size.checked_add(align - 1).ok_or_else(|| GraphicsError::CapacityExceeded {
        what: format!("size aligned to {align}"),
        requested: size,
        capacity: u64::MAX - (align - 1),
    })?;
    Ok(padded & !(align - 1))
}

/// `value` 是否已经按 `align` 对齐
#[inline]
pub fn is_aligned(value: u64, align: u64) -> bool {
    align.is_power_of_two() && value & (align - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_examples() {
        assert_eq!(align_up(37, 32).unwrap(), 64);
        assert_eq!(align_up(32, 32).unwrap(), 32);
        assert_eq!(align_up(0, 64).unwrap(), 0);
    }

    #[test]
    fn test_align_properties() {
        for shift in 0..12 {
            let a = 1u64 << shift;
            for x in 0..600u64 {
                let y = align_up(x, a).unwrap();
                assert_eq!(y % a, 0);
                assert!(y >= x);
                assert!(y - x < a);
                // 幂等
                assert_eq!(align_up(y, a).unwrap(), y);
                assert!(is_aligned(y, a));
            }
        }
    }

    #[test]
    fn test_align_top_of_range() {
        assert_eq!(align_up(u64::MAX, 1).unwrap(), u64::MAX);
        assert_eq!(align_up(u64::MAX - 31, 32).unwrap(), u64::MAX - 31);
        assert!(matches!(
            align_up(u64::MAX - 3, 32),
            Err(GraphicsError::CapacityExceeded { requested, .. }) if requested == u64::MAX - 3
        ));
        assert!(align_up(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_align_rejects_non_power_of_two() {
        assert_eq!(align_up(10, 0), Err(GraphicsError::AlignmentViolation { align: 0 }));
        assert_eq!(align_up(10, 48), Err(GraphicsError::AlignmentViolation { align: 48 }));
        assert!(!is_aligned(96, 48));
    }
}
