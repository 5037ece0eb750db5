//! Branch naming for task branches.
//!
//! Names come from a configurable minijinja template with `id`, `slug` and
//! `title` placeholders, e.g. `task/{{ id }}-{{ slug }}`.

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};

use super::types::Task;

pub const DEFAULT_BRANCH_TEMPLATE: &str = "task/{{ id }}-{{ slug }}";

const MAX_SLUG_LEN: usize = 40;

/// Lowercase ASCII slug: runs of non-alphanumerics collapse to one `-`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }
    slug
}

/// Render the branch name for `task` from `template`.
pub fn render_branch_name(template: &str, task: &Task) -> Result<String> {
    let env = Environment::new();
    let slug = slugify(&task.title);
    let rendered = env
        .render_str(
            template,
            context! {
                id => task.id.as_str(),
                slug => slug.as_str(),
                title => task.title.as_str(),
            },
        )
        .with_context(|| format!("render branch template '{template}'"))?;
    let name = rendered.trim().trim_end_matches(['-', '/']).to_string();
    validate_branch_name(&name)?;
    Ok(name)
}

/// Reject names git would refuse (subset of `git check-ref-format`).
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("branch name must not be empty"));
    }
    if name.starts_with('-') || name.starts_with('/') || name.ends_with('/') {
        return Err(anyhow!("branch name '{name}' has an invalid leading/trailing character"));
    }
    if name.ends_with(".lock") || name.ends_with('.') {
        return Err(anyhow!("branch name '{name}' has an invalid suffix"));
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return Err(anyhow!("branch name '{name}' contains an invalid sequence"));
    }
    if name
        .chars()
        .any(|c| c.is_ascii_control() || c.is_whitespace() || "~^:?*[\\".contains(c))
    {
        return Err(anyhow!("branch name '{name}' contains an invalid character"));
    }
    if name.split('/').any(|part| part.starts_with('.')) {
        return Err(anyhow!("branch name '{name}' has a component starting with '.'"));
    }
    Ok(())
}
