//! Sparse multivariate polynomials with complex coefficients.
//!
//! Only what is needed to rewrite a polynomial vector field under a linear
//! change of coordinates: sums, products and linear forms.

use anyhow::{bail, Result};
use num_complex::Complex64;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

type Monomial = Vec<usize>;

#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    dimension: usize,
    terms: BTreeMap<Monomial, Complex64>,
}

impl Polynomial {
    pub fn zero(dimension: usize) -> Self {
        Self {
            dimension,
            terms: BTreeMap::new(),
        }
    }

    pub fn one(dimension: usize) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(vec![0; dimension], Complex64::new(1.0, 0.0));
        Self { dimension, terms }
    }

    /// `Σ_i coeffs[i] z_i`.
    pub fn linear_form(coeffs: &[Complex64]) -> Self {
        let dimension = coeffs.len();
        let mut terms = BTreeMap::new();
        for (i, &c) in coeffs.iter().enumerate() {
            if c != Complex64::new(0.0, 0.0) {
                let mut mono = vec![0; dimension];
                mono[i] = 1;
                terms.insert(mono, c);
            }
        }
        Self { dimension, terms }
    }

    pub fn coefficient(&self, exponent: &[usize]) -> Complex64 {
        self.terms
            .get(exponent)
            .copied()
            .unwrap_or_else(|| Complex64::new(0.0, 0.0))
    }

    fn add_term(&mut self, mono: Monomial, c: Complex64) {
        match self.terms.entry(mono) {
            Entry::Vacant(slot) => {
                if c != Complex64::new(0.0, 0.0) {
                    slot.insert(c);
                }
            }
            Entry::Occupied(mut slot) => {
                *slot.get_mut() += c;
                if *slot.get() == Complex64::new(0.0, 0.0) {
                    slot.remove();
                }
            }
        }
    }

    pub fn add(&self, other: &Self) -> Result<Self> {
        self.check_dimension(other)?;
        let mut out = self.clone();
        for (m, &c) in &other.terms {
            out.add_term(m.clone(), c);
        }
        Ok(out)
    }

    pub fn scale(&self, k: Complex64) -> Self {
        if k == Complex64::new(0.0, 0.0) {
            return Self::zero(self.dimension);
        }
        let terms = self.terms.iter().map(|(m, &c)| (m.clone(), c * k)).collect();
        Self {
            dimension: self.dimension,
            terms,
        }
    }

    pub fn mul(&self, other: &Self) -> Result<Self> {
        self.check_dimension(other)?;
        let mut out = Self::zero(self.dimension);
        for (m1, &c1) in &self.terms {
            for (m2, &c2) in &other.terms {
                let mono: Monomial = m1.iter().zip(m2).map(|(a, b)| a + b).collect();
                out.add_term(mono, c1 * c2);
            }
        }
        Ok(out)
    }

    fn check_dimension(&self, other: &Self) -> Result<()> {
        if self.dimension != other.dimension {
            bail!(
                "Polynomial dimension mismatch: {} vs {}.",
                self.dimension,
                other.dimension
            );
        }
        Ok(())
    }
}
