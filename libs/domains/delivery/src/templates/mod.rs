//! Email template rendering.
//!
//! Handlebars-based renderer with built-in templates registered as
//! `{name}_subject`, `{name}_html`, and `{name}_text`. Unknown template
//! names return [`TemplateError::NotFound`]; bad context never fails a
//! render, missing values simply come out empty.

use handlebars::Handlebars;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Subject used when neither the request nor the template provides one.
pub const FALLBACK_SUBJECT: &str = "(no subject)";

/// Rendered parts of an email; any of them may be absent.
#[derive(Debug, Clone, Default)]
pub struct RenderedEmail {
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Template rendering error: {0}")]
    Render(String),
}

/// Template engine with the built-in template set registered.
pub struct TemplateEngine {
    handlebars: Arc<Handlebars<'static>>,
}

impl TemplateEngine {
    pub fn new() -> Result<Self, TemplateError> {
        let mut handlebars = Handlebars::new();

        let builtins: [(&str, &str, &str, &str); 3] = [
            (
                "welcome",
                WELCOME_SUBJECT,
                WELCOME_HTML_TEMPLATE,
                WELCOME_TEXT_TEMPLATE,
            ),
            (
                "password_reset",
                PASSWORD_RESET_SUBJECT,
                PASSWORD_RESET_HTML_TEMPLATE,
                PASSWORD_RESET_TEXT_TEMPLATE,
            ),
            (
                "notification",
                NOTIFICATION_SUBJECT,
                NOTIFICATION_HTML_TEMPLATE,
                NOTIFICATION_TEXT_TEMPLATE,
            ),
        ];

        for (name, subject, html, text) in builtins {
            for (suffix, template) in [("subject", subject), ("html", html), ("text", text)] {
                handlebars
                    .register_template_string(&format!("{}_{}", name, suffix), template)
                    .map_err(|e| {
                        TemplateError::Render(format!("failed to register {}_{}: {}", name, suffix, e))
                    })?;
            }
        }

        Ok(Self {
            handlebars: Arc::new(handlebars),
        })
    }

    /// Whether a template with this name is registered.
    pub fn has_template(&self, name: &str) -> bool {
        self.handlebars.has_template(&format!("{}_html", name))
            || self.handlebars.has_template(&format!("{}_text", name))
    }

    /// Render a template by name with the given context.
    ///
    /// Returns `NotFound` for unregistered names so the caller can apply
    /// its fallback; never fails on missing context values.
    pub fn render(
        &self,
        name: &str,
        context: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<RenderedEmail, TemplateError> {
        if !self.has_template(name) {
            return Err(TemplateError::NotFound(name.to_string()));
        }

        debug!(template = %name, "Rendering email template");

        let mut rendered = RenderedEmail::default();
        for (suffix, slot) in [
            ("subject", &mut rendered.subject),
            ("html", &mut rendered.html),
            ("text", &mut rendered.text),
        ] {
            let template_name = format!("{}_{}", name, suffix);
            if self.handlebars.has_template(&template_name) {
                let output = self
                    .handlebars
                    .render(&template_name, context)
                    .map_err(|e| TemplateError::Render(e.to_string()))?;
                if !output.trim().is_empty() {
                    *slot = Some(output);
                }
            }
        }

        Ok(rendered)
    }
}

/// Plain-text dump of the template context, used as the body when a
/// template cannot be resolved.
pub fn fallback_text(context: &serde_json::Map<String, serde_json::Value>) -> String {
    serde_json::to_string_pretty(context).unwrap_or_else(|_| "{}".to_string())
}

// ============================================================================
// Built-in templates
// ============================================================================

const WELCOME_SUBJECT: &str = "Welcome aboard{{#if user_name}}, {{user_name}}{{/if}}!";

const WELCOME_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Welcome</title>
</head>
<body style="margin: 0; padding: 0; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background-color: #f4f4f5;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 40px 20px;">
    <tr>
      <td style="background-color: #ffffff; border-radius: 8px; padding: 40px;">
        <h1 style="color: #18181b; font-size: 24px; font-weight: 600; margin: 0 0 16px 0; text-align: center;">
          Welcome{{#if user_name}}, {{user_name}}{{/if}}!
        </h1>
        <p style="color: #52525b; font-size: 16px; line-height: 24px; margin: 0 0 24px 0; text-align: center;">
          Your account has been created successfully and you're ready to get started.
        </p>
        {{#if dashboard_url}}
        <table width="100%" cellspacing="0" cellpadding="0">
          <tr>
            <td style="text-align: center;">
              <a href="{{dashboard_url}}" style="display: inline-block; background-color: #2563eb; color: #ffffff; font-size: 16px; font-weight: 500; padding: 12px 32px; text-decoration: none; border-radius: 6px;">
                Go to Dashboard
              </a>
            </td>
          </tr>
        </table>
        {{/if}}
      </td>
    </tr>
    <tr>
      <td style="padding: 24px 0; text-align: center;">
        <p style="color: #a1a1aa; font-size: 11px; margin: 0;">
          {{company_name}}
        </p>
      </td>
    </tr>
  </table>
</body>
</html>"#;

const WELCOME_TEXT_TEMPLATE: &str = r#"Welcome{{#if user_name}}, {{user_name}}{{/if}}!

Your account has been created successfully and you're ready to get started.

{{#if dashboard_url}}
Go to your dashboard: {{dashboard_url}}
{{/if}}

{{company_name}}"#;

const PASSWORD_RESET_SUBJECT: &str = "Reset your password";

const PASSWORD_RESET_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Reset Your Password</title>
</head>
<body style="margin: 0; padding: 0; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background-color: #f4f4f5;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 40px 20px;">
    <tr>
      <td style="background-color: #ffffff; border-radius: 8px; padding: 40px;">
        <h1 style="color: #18181b; font-size: 24px; font-weight: 600; margin: 0 0 16px 0; text-align: center;">
          Reset your password
        </h1>
        <p style="color: #52525b; font-size: 16px; line-height: 24px; margin: 0 0 24px 0; text-align: center;">
          Hi {{user_name}}, we received a request to reset your password. Click the button below to create a new one.
        </p>
        <table width="100%" cellspacing="0" cellpadding="0">
          <tr>
            <td style="text-align: center;">
              <a href="{{reset_url}}" style="display: inline-block; background-color: #dc2626; color: #ffffff; font-size: 16px; font-weight: 500; padding: 12px 32px; text-decoration: none; border-radius: 6px;">
                Reset Password
              </a>
            </td>
          </tr>
        </table>
        {{#if expiry_hours}}
        <p style="color: #71717a; font-size: 12px; text-align: center; margin: 16px 0 0 0;">
          This link expires in {{expiry_hours}} hour(s).
        </p>
        {{/if}}
        <p style="color: #71717a; font-size: 12px; text-align: center; margin: 24px 0 0 0;">
          If you didn't request this password reset, you can safely ignore this email.
        </p>
      </td>
    </tr>
    <tr>
      <td style="padding: 24px 0; text-align: center;">
        <p style="color: #a1a1aa; font-size: 11px; margin: 0;">
          {{company_name}}
        </p>
      </td>
    </tr>
  </table>
</body>
</html>"#;

const PASSWORD_RESET_TEXT_TEMPLATE: &str = r#"Reset your password

Hi {{user_name}},

We received a request to reset your password. Use the link below to create a new one:

{{reset_url}}

{{#if expiry_hours}}
This link expires in {{expiry_hours}} hour(s).
{{/if}}

If you didn't request this password reset, you can safely ignore this email.

{{company_name}}"#;

const NOTIFICATION_SUBJECT: &str = "{{#if title}}{{title}}{{else}}You have a new notification{{/if}}";

const NOTIFICATION_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Notification</title>
</head>
<body style="margin: 0; padding: 0; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background-color: #f4f4f5;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 40px 20px;">
    <tr>
      <td style="background-color: #ffffff; border-radius: 8px; padding: 40px;">
        <h1 style="color: #18181b; font-size: 24px; font-weight: 600; margin: 0 0 16px 0; text-align: center;">
          {{#if title}}{{title}}{{else}}Notification{{/if}}
        </h1>
        {{#if body}}
        <p style="color: #52525b; font-size: 16px; line-height: 24px; margin: 0 0 24px 0; text-align: center;">
          {{body}}
        </p>
        {{/if}}
        {{#if action_url}}
        <table width="100%" cellspacing="0" cellpadding="0">
          <tr>
            <td style="text-align: center;">
              <a href="{{action_url}}" style="display: inline-block; background-color: #2563eb; color: #ffffff; font-size: 16px; font-weight: 500; padding: 12px 32px; text-decoration: none; border-radius: 6px;">
                {{#if action_label}}{{action_label}}{{else}}View{{/if}}
              </a>
            </td>
          </tr>
        </table>
        {{/if}}
      </td>
    </tr>
  </table>
</body>
</html>"#;

const NOTIFICATION_TEXT_TEMPLATE: &str = r#"{{#if title}}{{title}}{{else}}Notification{{/if}}

{{#if body}}
{{body}}
{{/if}}

{{#if action_url}}
{{#if action_label}}{{action_label}}{{else}}View{{/if}}: {{action_url}}
{{/if}}"#;
