use crate::{error::Error, tensor::Parameters};

mod checkpoint;
pub(crate) use checkpoint::Checkpoint;

mod submodule;
pub(crate) use submodule::Submodule;

/// Anything that can hand over a model's named parameters.
pub(crate) trait ParameterSource {
    fn parameters(&self) -> Result<Parameters, Error>;
}

#[cfg(test)]
impl ParameterSource for Parameters {
    fn parameters(&self) -> Result<Parameters, Error> {
        Ok(self.clone())
    }
}
