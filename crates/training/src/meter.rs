/// Running weighted average of a scalar.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: usize,
    pub avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `val` observed `n` times.
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
