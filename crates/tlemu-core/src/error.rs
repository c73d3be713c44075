use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("loader chain info not found in {0} pNext chain")]
    ChainInfoMissing(&'static str),

    #[error("unknown {0} handle")]
    UnknownHandle(&'static str),

    #[error("next layer does not provide {0}")]
    MissingEntryPoint(&'static str),

    #[error("vulkan call failed: {0:?}")]
    Vulkan(vk::Result),

    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<vk::Result> for LayerError {
    fn from(result: vk::Result) -> Self {
        LayerError::Vulkan(result)
    }
}

impl From<LayerError> for vk::Result {
    fn from(err: LayerError) -> Self {
        match err {
            LayerError::Vulkan(result) => result,
            _ => vk::Result::ERROR_INITIALIZATION_FAILED,
        }
    }
}
