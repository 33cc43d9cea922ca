//! Amount arithmetic: splitting decimal amounts into powers of two, overflow
//! safe summing and the per-input fee rule.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::NutmegCoreError;

#[derive(Debug, Clone)]
pub struct Amount(pub u64);

impl Amount {
    pub fn split(&self) -> SplitAmount {
        split_amount(self.0).into()
    }
}

impl From<u64> for Amount {
    fn from(amount: u64) -> Self {
        Self(amount)
    }
}

#[derive(Debug, Clone)]
pub struct SplitAmount(Vec<u64>);

impl From<Vec<u64>> for SplitAmount {
    fn from(from: Vec<u64>) -> Self {
        Self(from)
    }
}

impl SplitAmount {
    pub fn create_secrets(&self) -> Vec<String> {
        (0..self.0.len())
            .map(|_| generate_random_string())
            .collect::<Vec<String>>()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for SplitAmount {
    type Item = u64;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// split a decimal amount into a vector of powers of 2
pub fn split_amount(amount: u64) -> Vec<u64> {
    format!("{amount:b}")
        .chars()
        .rev()
        .enumerate()
        .filter_map(|(i, c)| {
            if c == '1' {
                return Some(2_u64.pow(i as u32));
            }
            None
        })
        .collect::<Vec<u64>>()
}

/// Sums amounts, failing instead of wrapping on u64 overflow.
pub fn checked_sum(amounts: impl IntoIterator<Item = u64>) -> Result<u64, NutmegCoreError> {
    amounts
        .into_iter()
        .try_fold(0u64, |acc, amount| acc.checked_add(amount))
        .ok_or(NutmegCoreError::AmountOverflow)
}

/// Fee charged for a set of inputs: the sum of each input keyset's
/// `input_fee_ppk`, rounded up to whole sats.
pub fn total_input_fee(fee_ppks: impl IntoIterator<Item = u64>) -> Result<u64, NutmegCoreError> {
    Ok(checked_sum(fee_ppks)?.div_ceil(1000))
}

pub fn generate_random_string() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::amount::SplitAmount;

    #[test]
    fn test_split_amount() -> anyhow::Result<()> {
        let bits = super::split_amount(13);
        assert_eq!(bits, vec![1, 4, 8]);

        let bits = super::split_amount(63);
        assert_eq!(bits, vec![1, 2, 4, 8, 16, 32]);

        let bits = super::split_amount(64);
        assert_eq!(bits, vec![64]);
        Ok(())
    }

    #[test]
    fn test_create_secrets() {
        let amounts = vec![1, 2, 3, 4, 5, 6, 7];
        let secrets = SplitAmount::from(amounts.clone()).create_secrets();
        assert!(secrets.len() == amounts.len());
        assert_eq!(secrets.first().unwrap().len(), 24);
    }

    #[test]
    fn test_checked_sum() {
        assert_eq!(super::checked_sum(vec![1, 2, 4]).unwrap(), 7);
        assert!(super::checked_sum(vec![u64::MAX, 1]).is_err());
    }

    #[test]
    fn test_total_input_fee() {
        // three inputs of 100 ppk round up to a single sat
        assert_eq!(super::total_input_fee(vec![100, 100, 100]).unwrap(), 1);
        assert_eq!(super::total_input_fee(vec![1000, 1000]).unwrap(), 2);
        assert_eq!(super::total_input_fee(vec![0, 0]).unwrap(), 0);
        assert_eq!(super::total_input_fee(vec![1]).unwrap(), 1);
    }
}
