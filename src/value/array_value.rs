use crate::value::FieldValue;

#[derive(Clone, Debug, PartialEq)]
pub struct ArrayValue {
    values: Vec<FieldValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn empty() -> Self {
        Self { values: Vec::new() }
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut Vec<FieldValue> {
        &mut self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Membership by value equality, the same notion queries use for
    /// `array-contains`.
    pub fn contains(&self, value: &FieldValue) -> bool {
        self.values.iter().any(|element| element == value)
    }
}
