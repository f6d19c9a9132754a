#[derive(Debug, Clone, Copy, Default)]
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
    fn derivative_matches_finite_difference() {
        let sigmoid = Sigmoid::new(2.);
        let h = 1e-3;

        for z in [-3., -0.5, 0., 0.7, 4.] {
            let numeric = (sigmoid.f(z + h) - sigmoid.f(z - h)) / (2. * h);
            assert!((numeric - sigmoid.df(z)).abs() < 1e-3, "z = {z}");
        }
    }
}
