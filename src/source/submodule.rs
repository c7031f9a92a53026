use crate::{error::Error, source::ParameterSource, tensor::Parameters};

/// The parameters of one submodule, e.g. `bn1`, with the `bn1.` prefix removed.
pub(crate) struct Submodule<S> {
    source: S,
    prefix: String,
}

impl<S> Submodule<S> {
    pub(crate) fn new<P>(source: S, prefix: P) -> Self
    where
        P: Into<String>,
    {
        let mut prefix = prefix.into();
        if !prefix.ends_with('.') {
            prefix.push('.');
        }
        Self { source, prefix }
    }
}

impl<S> ParameterSource for Submodule<S>
where
    S: ParameterSource,
{
    fn parameters(&self) -> Result<Parameters, Error> {
        let selected = self
            .source
            .parameters()?
            .into_iter()
            .filter_map(|(name, parameter)| {
                name.strip_prefix(&self.prefix)
                    .map(|local| (local.to_owned(), parameter))
            })
            .collect::<Parameters>();

        if selected.is_empty() {
            return Err(Error::EmptySubmodule(
                self.prefix.trim_end_matches('.').to_owned(),
            ));
        }
        Ok(selected)
    }
}
