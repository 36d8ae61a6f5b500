use wallet_api::Allocation;

use crate::error::ManagerError;

/// One entry of a capacity plan.
#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub allocation: Allocation,
    pub adjustment: CapacityAdjustment,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CapacityAdjustment {
    /// Raise to an absolute target; never reduces the current capacity.
    SetTo(u64),
    IncreaseBy(u64),
    /// Multiply the current capacity. Requires a factor >= 1 and a non-empty
    /// allocation.
    ScaleBy(f64),
}

/// Desired capacity before clamping to the funding ceiling.
pub fn target_capacity(
    adjustment: CapacityAdjustment,
    current: usize,
) -> Result<usize, ManagerError> {
    match adjustment {
        CapacityAdjustment::SetTo(n) => Ok(current.max(n as usize)),
        CapacityAdjustment::IncreaseBy(n) => Ok(current.saturating_add(n as usize)),
        CapacityAdjustment::ScaleBy(factor) => {
            if !factor.is_finite() || factor < 1.0 {
                return Err(ManagerError::Validation(format!(
                    "scale factor must be a finite number >= 1, got {factor}"
                )));
            }
            if current == 0 {
                return Err(ManagerError::Validation(
                    "cannot scale an allocation with no channels".to_string(),
                ));
            }
            Ok((current as f64 * factor).ceil() as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_to_never_reduces() {
        assert_eq!(target_capacity(CapacityAdjustment::SetTo(5), 0).unwrap(), 5);
        assert_eq!(target_capacity(CapacityAdjustment::SetTo(2), 4).unwrap(), 4);
    }

    #[test]
    fn increase_adds() {
        assert_eq!(
            target_capacity(CapacityAdjustment::IncreaseBy(3), 2).unwrap(),
            5
        );
    }

    #[test]
    fn scale_rounds_up() {
        assert_eq!(
            target_capacity(CapacityAdjustment::ScaleBy(1.5), 3).unwrap(),
            5
        );
        assert_eq!(
            target_capacity(CapacityAdjustment::ScaleBy(2.0), 4).unwrap(),
            8
        );
    }

    #[test]
    fn scale_rejects_bad_factors() {
        assert!(target_capacity(CapacityAdjustment::ScaleBy(0.5), 3).is_err());
        assert!(target_capacity(CapacityAdjustment::ScaleBy(f64::NAN), 3).is_err());
        assert!(target_capacity(CapacityAdjustment::ScaleBy(2.0), 0).is_err());
    }
}
