pub mod http;
pub mod parse;
pub mod template;

pub use http::{
    http_delete, http_get, http_get_with_query, http_patch_json, http_post_json, http_put_json,
};
pub use parse::{extract_json, strip_code_fences};
pub use template::render;
