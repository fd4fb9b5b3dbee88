use std::fmt::Display;

#[derive(Debug)]
pub enum Error {
    IOError (std::io::Error),
    YamlError (serde_yaml::Error),
    TemplateError (indicatif::style::TemplateError),
    SparseError (crate::sparse::SparseError),
    TableError (crate::ptable::TableError),
    MbrError (crate::mbr::MbrError),
    ProbeError (crate::probe::ProbeError),
    UpdateError (crate::update::UpdateError),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Self::YamlError(value)
    }
}

impl From<indicatif::style::TemplateError> for Error {
    fn from(value: indicatif::style::TemplateError) -> Self {
        Self::TemplateError(value)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IOError(e) => write!(f, "I/O error: {}", e),
            Error::YamlError(e) => write!(f, "config error: {}", e),
            Error::TemplateError(e) => write!(f, "progress template error: {}", e),
            Error::SparseError(e) => write!(f, "sparse: {}", e),
            Error::TableError(e) => write!(f, "mpt: {}", e),
            Error::MbrError(e) => write!(f, "mbr: {}", e),
            Error::ProbeError(e) => write!(f, "probe: {}", e),
            Error::UpdateError(e) => write!(f, "update: {}", e),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
