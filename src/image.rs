use std::fmt;
use std::str::FromStr;

use crate::engine::ContainerEngine;
use crate::error::LaunchFailure;

/// Image reference split into repository and optional tag.
///
/// Only the `repository` and `repository:tag` forms are accepted. A missing
/// tag is left to the engine, which resolves it to `latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub repository: String,
    pub tag: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self, LaunchFailure> {
        let invalid = |reason: &str| LaunchFailure::ImageResolution {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.trim().is_empty() {
            return Err(invalid("reference is empty"));
        }

        let parts: Vec<&str> = reference.split(':').collect();
        match parts.as_slice() {
            [repository] => Ok(Self {
                repository: repository.to_string(),
                tag: None,
            }),
            [repository, tag] => {
                if repository.is_empty() {
                    return Err(invalid("repository is empty"));
                }
                if tag.is_empty() {
                    return Err(invalid("tag is empty"));
                }
                Ok(Self {
                    repository: repository.to_string(),
                    tag: Some(tag.to_string()),
                })
            }
            _ => Err(invalid("expected at most one ':' separating repository and tag")),
        }
    }
}

impl FromStr for ImageReference {
    type Err = LaunchFailure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageReference::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}:{}", self.repository, tag),
            None => write!(f, "{}", self.repository),
        }
    }
}

/// Parse `reference` and make sure the engine has the image locally.
pub fn resolve<E: ContainerEngine + ?Sized>(
    engine: &E,
    reference: &str,
) -> Result<ImageReference, LaunchFailure> {
    let image = ImageReference::parse(reference)?;
    log::info!("pulling image {image}");
    engine.pull(&image).map_err(|source| LaunchFailure::Pull {
        reference: image.to_string(),
        source,
    })?;
    Ok(image)
}
