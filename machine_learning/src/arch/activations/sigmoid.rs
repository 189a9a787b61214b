/// A logistic function scaled to `(0, amp)`.
#[derive(Clone, Debug)]
pub struct Sigmoid {
    amp: f32,
}

impl Sigmoid {
    pub fn new(amp: f32) -> Self {
        Self { amp }
    }

    pub fn f(&self, z: f32) -> f32 {
        self.amp / (1. + (-z).exp())
    }

    pub fn df(&self, z: f32) -> f32 {
        let s = 1. / (1. + (-z).exp());
        self.amp * s * (1. - s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_is_centered_at_half_amplitude() {
        let sigmoid = Sigmoid::new(2.0);
        assert_eq!(sigmoid.f(0.0), 1.0);
        assert_eq!(sigmoid.df(0.0), 0.5);
    }
}
