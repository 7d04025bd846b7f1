use crate::api::ollama::{OllamaShowRequest, OllamaShowResponse, OllamaTags};
use crate::core::error::ProviderError;
use crate::core::providers::http::{construct_api_url, read_json, send};
use crate::core::providers::ProviderKind;

/// Lists the models installed on a local Ollama server.
pub async fn fetch_ollama_models(
    client: &reqwest::Client,
    base_url: &str,
) -> Result<Vec<String>, ProviderError> {
    let url = construct_api_url(base_url, "api/tags");
    let response = send(ProviderKind::Ollama, client.get(url)).await?;
    let tags: OllamaTags = read_json(ProviderKind::Ollama, response).await?;
    let mut names: Vec<String> = tags.models.into_iter().map(|tag| tag.name).collect();
    sort_models(&mut names);
    Ok(names)
}

/// Reads a local model's trained context window from `/api/show`.
pub async fn fetch_ollama_context_length(
    client: &reqwest::Client,
    base_url: &str,
    model: &str,
) -> Result<Option<u32>, ProviderError> {
    let url = construct_api_url(base_url, "api/show");
    let request = client.post(url).json(&OllamaShowRequest { model });
    let response = send(ProviderKind::Ollama, request).await?;
    let info: OllamaShowResponse = read_json(ProviderKind::Ollama, response).await?;
    Ok(info.context_length())
}

pub fn sort_models(models: &mut [String]) {
    models.sort_by(|a, b| a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()));
}
