use derive_more::{Display, From, Into};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Display, From, Into,
        )]
        #[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
        pub struct $name(pub u32);
    };
}

identifier!(
    /// Identifies a captured image.
    ViewId
);
identifier!(
    /// Identifies the rigid pose of a view. Several views may share a pose (rigs).
    PoseId
);
identifier!(
    /// Identifies a calibration group shared by one or more views.
    IntrinsicId
);
identifier!(
    /// Identifies a track, and the landmark triangulated from it.
    TrackId
);
identifier!(
    /// Index of a feature within the ordered feature list of one view.
    FeatureId
);

impl FeatureId {
    /// The feature index as a `usize`, for slicing into a feature list.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An unordered pair of views, stored with the smaller id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ViewPair(ViewId, ViewId);

impl ViewPair {
    pub fn new(a: ViewId, b: ViewId) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }

    pub fn first(self) -> ViewId {
        self.0
    }

    pub fn second(self) -> ViewId {
        self.1
    }

    /// Returns `true` if both entries refer to the same view.
    pub fn is_degenerate(self) -> bool {
        self.0 == self.1
    }

    pub fn contains(self, view: ViewId) -> bool {
        self.0 == view || self.1 == view
    }
}

impl core::fmt::Display for ViewPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {})", self.0, self.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_canonical() {
        let a = ViewPair::new(ViewId(4), ViewId(2));
        let b = ViewPair::new(ViewId(2), ViewId(4));
        assert_eq!(a, b);
        assert_eq!(a.first(), ViewId(2));
        assert_eq!(a.second(), ViewId(4));
        assert!(!a.is_degenerate());
        assert!(ViewPair::new(ViewId(0), ViewId(0)).is_degenerate());
        assert_eq!(a.to_string(), "(2, 4)");
    }
}
