/// A hardware tick count. Digitizers report these as signed 32-bit values which
/// wrap around, so every comparison goes through wrapping subtraction rather
/// than `Ord`.
///
/// There is intentionally no `PartialOrd` - `i32::MAX` is *older* than `i32::MIN`
/// in wrap space, and a naive comparison would say otherwise.
#[derive(Copy, Clone, Hash, PartialEq, Eq, Debug, Default)]
pub struct Tick(pub i32);

impl Tick {
    #[must_use]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }
    #[must_use]
    pub const fn get(self) -> i32 {
        self.0
    }
    /// Signed distance from `earlier` to `self`, wrap-aware.
    #[must_use]
    pub const fn since(self, earlier: Tick) -> i32 {
        self.0.wrapping_sub(earlier.0)
    }
    /// The tick immediately following this one.
    #[must_use]
    pub const fn successor(self) -> Tick {
        Tick(self.0.wrapping_add(1))
    }
    /// Whether `self` is strictly newer than `other`.
    #[must_use]
    pub const fn is_after(self, other: Tick) -> bool {
        other.0.wrapping_sub(self.0) < 0
    }
    /// Given the last tick reported for a device, fix up an incoming raw tick so that
    /// the reported stream is strictly increasing.
    ///
    /// If `raw` is not strictly newer than `last`, it's replaced by `last + 1`.
    #[must_use]
    pub const fn normalize(last: Tick, raw: Tick) -> Tick {
        if last.0.wrapping_sub(raw.0) >= 0 {
            last.successor()
        } else {
            raw
        }
    }
    /// Whether two ticks are at most `window` apart in either direction.
    #[must_use]
    pub const fn within(self, other: Tick, window: u32) -> bool {
        self.since(other).unsigned_abs() <= window
    }
}

impl From<i32> for Tick {
    fn from(value: i32) -> Self {
        Self(value)
    }
}
impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}
