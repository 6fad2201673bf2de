//! Prompt text for the two completion calls.

use anyhow::{Context, Result};

use crate::models::QueryResult;
use crate::schema::CollectionSchema;

/// System message sent with both completion calls.
pub const SYSTEM_INSTRUCTION: &str =
    "You are an expert database engineer and data scientist. Return your responses only in code.";

/// Prompt asking the model for a query expression answering `question`.
pub fn build_query_prompt(question: &str, schema: &CollectionSchema) -> String {
    format!(
        "Generate a MongoDB query in JavaScript using the following question and for db.{collection} provided schema:\n\
         \n\
         Question:\n\
         {question}\n\
         \n\
         Schema:\n\
         {schema}\n\
         \n\
         Write a single read-only expression on db.{collection} inside one ``` fenced code block.\n\
         Use only find, findOne, aggregate, countDocuments or distinct, with sort, limit, skip and \
         project on find. Pipeline stages: $match, $group, $project, $sort, $limit, $skip, $count. \
         Use literal values only; write dates as Date(\"YYYY-MM-DD\").",
        collection = schema.collection,
        question = question.trim(),
        schema = schema.describe(),
    )
}

/// Prompt asking the model to narrate a query result.
pub fn build_summary_prompt(result: &QueryResult) -> Result<String> {
    let data = serde_json::to_string_pretty(result).context("Failed to render query result")?;
    Ok(format!(
        "Given the following data:\n\n{}\n\nPlease provide a key takeaway and represent the data in a markdown table.",
        data
    ))
}
