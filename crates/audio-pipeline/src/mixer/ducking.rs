use crate::format::scale_audio_bytes;

/// Q15 gain for a reduction of 0, 1, ..., 50 dB: `2^(-db / 6.014) * 2^15`.
pub(crate) const DECIBEL_REDUCTION_TABLE: [i16; 51] = [
    32767, 29201, 26022, 23189, 20665, 18415, 16410, 14624, 13032, 11613, 10349, 9222, 8218, 7324,
    6527, 5816, 5183, 4619, 4116, 3668, 3269, 2913, 2596, 2313, 2061, 1837, 1637, 1459, 1300, 1158,
    1032, 920, 820, 731, 651, 580, 517, 461, 411, 366, 326, 291, 259, 231, 206, 183, 163, 146, 130,
    116, 103,
];

fn q15_factor(db_reduction: i32) -> i16 {
    let index = db_reduction.clamp(0, DECIBEL_REDUCTION_TABLE.len() as i32 - 1);
    DECIBEL_REDUCTION_TABLE[index as usize]
}

/// Attenuation ramp of one mixer source, moving 1 dB per step.
#[derive(Debug, Default)]
pub(crate) struct Ducking {
    current_db: i32,
    target_db: u8,
    transition_samples_remaining: u32,
    samples_per_step: u32,
    db_change_per_step: i32,
}

impl Ducking {
    /// Begin moving towards `db_reduction` over `transition_samples` samples.
    pub(crate) fn apply(&mut self, db_reduction: u8, transition_samples: u32) {
        if self.target_db == db_reduction {
            return;
        }
        self.current_db = self.target_db as i32;
        self.target_db = db_reduction;

        let distance = (self.target_db as i32 - self.current_db).abs();
        self.db_change_per_step = if self.target_db as i32 > self.current_db { 1 } else { -1 };
        // The first and last levels are reached at the ramp's ends, not held for a step.
        let total_steps = (distance - 1).max(0) as u32;

        if transition_samples > 0 && total_steps > 0 && transition_samples >= total_steps {
            self.samples_per_step = transition_samples / total_steps;
            self.transition_samples_remaining = self.samples_per_step * total_steps;
            self.current_db += self.db_change_per_step;
        } else {
            self.transition_samples_remaining = 0;
            self.current_db = self.target_db as i32;
        }
    }

    /// Scale little-endian 16-bit samples in place, advancing the ramp.
    pub(crate) fn duck(&mut self, bytes: &mut [u8]) {
        let mut samples_left = (bytes.len() / 2) as u32;
        let mut pos = 0usize;

        while self.transition_samples_remaining > 0 && samples_left > 0 {
            let mut left_in_step = self.transition_samples_remaining % self.samples_per_step;
            if left_in_step == 0 {
                left_in_step = self.samples_per_step;
            }
            let n = samples_left.min(left_in_step);

            let end = pos + n as usize * 2;
            scale_audio_bytes(&mut bytes[pos..end], q15_factor(self.current_db));
            if left_in_step == n {
                self.current_db += self.db_change_per_step;
            }

            pos = end;
            self.transition_samples_remaining -= n;
            samples_left -= n;
        }

        if self.current_db > 0 && samples_left > 0 {
            let end = pos + samples_left as usize * 2;
            scale_audio_bytes(&mut bytes[pos..end], q15_factor(self.current_db));
        }
    }

    pub(crate) fn current_db(&self) -> i32 {
        self.current_db
    }

    pub(crate) fn is_transitioning(&self) -> bool {
        self.transition_samples_remaining > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(samples: usize, value: i16) -> Vec<u8> {
        (0..samples).flat_map(|_| value.to_le_bytes()).collect()
    }

    fn samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    fn scaled(value: i16, db: usize) -> i16 {
        ((value as i32 * DECIBEL_REDUCTION_TABLE[db] as i32) >> 15) as i16
    }

    #[test]
    fn twenty_db_over_one_second_is_monotonic() {
        // 1000 ms at 16 kHz mono.
        let mut ducking = Ducking::default();
        ducking.apply(20, 16_000);
        let ramp_samples = 16_000 / 19 * 19;

        let mut bytes = constant(20_000, 10_000);
        for chunk in bytes.chunks_mut(2 * 733) {
            ducking.duck(chunk);
        }
        let out = samples(&bytes);

        assert!(out.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(out[0], scaled(10_000, 1));
        assert_eq!(out[ramp_samples - 1], scaled(10_000, 19));
        assert_eq!(out[ramp_samples], scaled(10_000, 20));
        assert_eq!(*out.last().unwrap(), scaled(10_000, 20));
        assert_eq!(ducking.current_db(), 20);
        assert!(!ducking.is_transitioning());
    }

    #[test]
    fn chunking_does_not_change_the_ramp() {
        let mut whole = Ducking::default();
        whole.apply(12, 4_000);
        let mut a = constant(5_000, -12_345);
        whole.duck(&mut a);

        let mut split = Ducking::default();
        split.apply(12, 4_000);
        let mut b = constant(5_000, -12_345);
        for chunk in b.chunks_mut(2 * 97) {
            split.duck(chunk);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn unducking_returns_to_unity() {
        let mut ducking = Ducking::default();
        ducking.apply(10, 0);
        assert_eq!(ducking.current_db(), 10);

        ducking.apply(0, 900);
        let mut bytes = constant(1_000, 8_000);
        ducking.duck(&mut bytes);
        let out = samples(&bytes);
        assert!(out.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(out[0], scaled(8_000, 9));
        assert_eq!(*out.last().unwrap(), 8_000);
    }

    #[test]
    fn reductions_beyond_table_are_clamped() {
        let mut ducking = Ducking::default();
        ducking.apply(80, 0);
        let mut bytes = constant(4, 30_000);
        ducking.duck(&mut bytes);
        assert_eq!(samples(&bytes), vec![scaled(30_000, 50); 4]);
    }
}
