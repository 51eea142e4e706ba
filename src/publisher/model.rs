use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct CreatePostResp {
    pub id: String,
}

#[derive(Deserialize, Debug)]
pub struct GraphErrorBody {
    pub message: String,
    pub code: i64,
}

#[derive(Deserialize, Debug)]
pub struct GraphErrorResp {
    pub error: GraphErrorBody,
}
