//! Root page shell rendering.
//!
//! The template carries quoted `"{{MARKER}}"` placeholders that are replaced
//! with single-quoted JSON so the page can parse them at load time.

use serde_json::Value;
use workbench_client::WorkbenchOptions;

const MARKER_REMOTE_USER_DATA_URI: &str = r#""{{REMOTE_USER_DATA_URI}}""#;
const MARKER_PRODUCT_CONFIGURATION: &str = r#""{{PRODUCT_CONFIGURATION}}""#;
const MARKER_WORKBENCH_WEB_CONFIGURATION: &str = r#""{{WORKBENCH_WEB_CONFIGURATION}}""#;
const MARKER_NLS_CONFIGURATION: &str = r#""{{NLS_CONFIGURATION}}""#;

pub fn render_root_page(
    template: &str,
    options: &WorkbenchOptions,
    commit: &str,
    version: &str,
) -> String {
    let mut options = options.clone();
    if let Some(product) = options.product_configuration.as_object_mut() {
        product.insert(
            "gatewayVersion".to_string(),
            Value::String(version.to_string()),
        );
    }

    let mut content = template
        .replace(
            MARKER_REMOTE_USER_DATA_URI,
            &single_quoted(&options.remote_user_data_uri),
        )
        .replace(
            MARKER_PRODUCT_CONFIGURATION,
            &single_quoted(&options.product_configuration),
        )
        .replace(
            MARKER_WORKBENCH_WEB_CONFIGURATION,
            &single_quoted(&options.workbench_web_configuration),
        )
        .replace(
            MARKER_NLS_CONFIGURATION,
            &single_quoted(&options.nls_configuration),
        );

    if commit != "development" {
        content = content
            .replace("<!-- PROD_ONLY", "")
            .replace("END_PROD_ONLY -->", "");
    }
    content
}

fn single_quoted(value: &Value) -> String {
    format!("'{value}'")
}
