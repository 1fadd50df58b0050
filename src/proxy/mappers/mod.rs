// Protocol mappers: upstream dialect in, OpenAI shapes out

pub mod openai;
pub mod sse;
pub mod thinking;
