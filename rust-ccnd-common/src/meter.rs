//! Activity meters.
//!
//! A meter tracks a lifetime total plus an exponentially aged rate, so the
//! stats surface can show per-face activity without keeping history.  The
//! daemon clock (whole seconds) drives the aging; the meter itself never
//! reads the system clock.

/// One counted quantity (bytes in, interests out, ...).
#[derive(Debug, Clone)]
pub struct Meter {
    what: &'static str,
    total: u64,
    /// Scaled rate accumulator; decays by 1/4 each second of inactivity.
    rate: u64,
    lastupdate: u64,
}

impl Meter {
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            total: 0,
            rate: 0,
            lastupdate: 0,
        }
    }

    pub fn what(&self) -> &'static str {
        self.what
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Count `amt` occurrences at daemon time `now_secs`.
    pub fn bump(&mut self, now_secs: u64, amt: u64) {
        self.age(now_secs);
        self.total += amt;
        self.rate = self.rate.saturating_add(amt * 4);
    }

    fn age(&mut self, now_secs: u64) {
        if now_secs != self.lastupdate {
            let steps = (now_secs.saturating_sub(self.lastupdate)).min(16);
            for _ in 0..steps {
                self.rate -= self.rate >> 2;
            }
            self.lastupdate = now_secs;
        }
    }

    /// Approximate per-second rate.
    pub fn rate(&self, now_secs: u64) -> u64 {
        let mut r = self.rate;
        let steps = (now_secs.saturating_sub(self.lastupdate)).min(16);
        for _ in 0..steps {
            r -= r >> 2;
        }
        r / 4
    }
}

/// The six per-face meters, indexable by [`FaceMeter`].
#[derive(Debug, Clone)]
pub struct FaceMeters {
    meters: [Meter; FACE_METER_N],
}

/// Face meter index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceMeter {
    BytesIn = 0,
    BytesOut = 1,
    InterestsIn = 2,
    InterestsOut = 3,
    ContentIn = 4,
    ContentOut = 5,
}

pub const FACE_METER_N: usize = 6;

impl FaceMeters {
    pub fn new() -> Self {
        Self {
            meters: [
                Meter::new("bytein"),
                Meter::new("byteout"),
                Meter::new("intrin"),
                Meter::new("introut"),
                Meter::new("datain"),
                Meter::new("dataout"),
            ],
        }
    }

    pub fn bump(&mut self, which: FaceMeter, now_secs: u64, amt: u64) {
        self.meters[which as usize].bump(now_secs, amt);
    }

    pub fn get(&self, which: FaceMeter) -> &Meter {
        &self.meters[which as usize]
    }
}

impl Default for FaceMeters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate() {
        let mut m = Meter::new("x");
        m.bump(1, 10);
        m.bump(1, 5);
        assert_eq!(m.total(), 15);
    }

    #[test]
    fn rate_decays_with_idle_seconds() {
        let mut m = Meter::new("x");
        for s in 0..10 {
            m.bump(s, 100);
        }
        let busy = m.rate(10);
        let idle = m.rate(20);
        assert!(busy > idle);
        assert_eq!(m.rate(1000), 0);
    }
}
