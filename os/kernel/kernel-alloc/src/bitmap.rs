//! One bit per physical frame; `1` means used.

pub struct FrameBitmap<'a> {
    words: &'a mut [u64],
    frames: usize,
}

impl<'a> FrameBitmap<'a> {
    /// Number of 64-bit words needed to track `frames` frames.
    #[inline]
    #[must_use]
    pub const fn words_for(frames: usize) -> usize {
        frames.div_ceil(64)
    }

    /// Wrap `words` as the bitmap for `frames` frames. Contents are kept.
    ///
    /// # Panics
    /// If `words` is shorter than [`words_for(frames)`](Self::words_for).
    pub fn new(words: &'a mut [u64], frames: usize) -> Self {
        assert!(words.len() >= Self::words_for(frames), "bitmap too small");
        Self { words, frames }
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    /// Mark every frame used, including the padding bits past the last frame.
    pub fn fill_used(&mut self) {
        self.words.fill(u64::MAX);
    }

    /// Frames at or beyond [`frames`](Self::frames) always read as used.
    #[inline]
    #[must_use]
    pub fn is_used(&self, frame: usize) -> bool {
        frame >= self.frames || self.words[frame / 64] & (1 << (frame % 64)) != 0
    }

    /// Set frames `[start, start + count)` to `used`; frames past the end are ignored.
    pub fn set_range(&mut self, start: usize, count: usize, used: bool) {
        let end = start.saturating_add(count).min(self.frames);
        let mut frame = start;
        while frame < end {
            let bit = frame % 64;
            let span = (64 - bit).min(end - frame);
            let mask = if span == 64 {
                u64::MAX
            } else {
                ((1u64 << span) - 1) << bit
            };
            let word = &mut self.words[frame / 64];
            if used {
                *word |= mask;
            } else {
                *word &= !mask;
            }
            frame += span;
        }
    }

    /// Whether every frame of `[start, start + count)` is used.
    #[must_use]
    pub fn all_used(&self, start: usize, count: usize) -> bool {
        (start..start.saturating_add(count)).all(|f| self.is_used(f))
    }

    /// Number of tracked frames currently marked used.
    #[must_use]
    pub fn count_used(&self) -> usize {
        (0..self.frames).filter(|&f| self.is_used(f)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_bits_stay_used() {
        let mut words = [0u64; 2];
        let mut bm = FrameBitmap::new(&mut words, 70);
        bm.fill_used();
        bm.set_range(0, 128, false);
        assert_eq!(bm.count_used(), 0);
        assert!(bm.is_used(70));
        assert!(bm.is_used(127));
        assert_eq!(words[1], u64::MAX << 6);
    }

    #[test]
    fn ranges_cross_word_boundaries() {
        let mut words = [0u64; 3];
        let mut bm = FrameBitmap::new(&mut words, 192);
        bm.set_range(60, 70, true);
        assert!(!bm.is_used(59));
        assert!(bm.all_used(60, 70));
        assert!(!bm.is_used(130));
        assert_eq!(bm.count_used(), 70);

        bm.set_range(64, 64, false);
        assert_eq!(bm.count_used(), 6);
        assert!(!bm.all_used(60, 10));
    }

    #[test]
    fn words_for_rounds_up() {
        assert_eq!(FrameBitmap::words_for(0), 0);
        assert_eq!(FrameBitmap::words_for(64), 1);
        assert_eq!(FrameBitmap::words_for(65), 2);
        assert_eq!(FrameBitmap::words_for(4096), 64);
    }
}
