use crate::common::*;

/// Image or region size in (height, width) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HW<T> {
    h: T,
    w: T,
}

impl<T> HW<T>
where
    T: Num + PartialOrd + Copy,
{
    /// Fails on negative extents. Zero extents are allowed.
    pub fn try_from_hw([h, w]: [T; 2]) -> Result<Self> {
        ensure!(
            h >= T::zero() && w >= T::zero(),
            "image sizes must be non-negative"
        );
        Ok(Self { h, w })
    }

    pub fn from_hw(hw: [T; 2]) -> Self {
        Self::try_from_hw(hw).unwrap()
    }

    pub fn h(&self) -> T {
        self.h
    }

    pub fn w(&self) -> T {
        self.w
    }

    pub fn area(&self) -> T {
        self.h * self.w
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_negative_sizes() {
        assert!(HW::try_from_hw([-1, 2]).is_err());
        assert!(HW::try_from_hw([0, 0]).is_ok());

        let size = HW::from_hw([3, 5]);
        assert_eq!((size.h(), size.w(), size.area()), (3, 5, 15));
    }
}
