//! 系统提示词：基础角色 + 难度说明 + 当前上下文 +（推理阶段）工具协议

use crate::core::{ContextRef, Difficulty};

pub const BASE_SYSTEM_PROMPT: &str = "당신은 아델리에의 AI 학습 가이드입니다. 한국 금융시장 초보자들에게 역사적 사례와 현재 상황을 비교하며 금융 지식을 전달합니다.";

/// thinking 事件的状态文本
pub const THINKING_STATUS: &str = "질문을 분석하고 있습니다...";

/// 工具轮数用尽后附加到回答阶段提示词
pub const ROUND_LIMIT_NOTE: &str =
    "도구 호출 한도에 도달했습니다. 지금까지 확인한 정보만으로 답변하고, 확인하지 못한 부분은 그렇다고 알려주세요.";

pub fn difficulty_instruction(difficulty: Difficulty) -> &'static str {
    match difficulty {
        Difficulty::Beginner => "주식 초보자에게 일상적인 비유를 사용해서 아주 쉽게 설명해주세요.",
        Difficulty::Elementary => {
            "기본 투자 용어를 아는 초급자에게 설명하세요. 간단한 수식이나 계산 예시 포함 가능합니다."
        }
        Difficulty::Intermediate => {
            "투자 경험이 있는 중급자에게 설명하세요. 심화 재무 분석과 정량적 데이터를 포함해도 됩니다."
        }
    }
}

/// 回答阶段的系统提示词
pub fn build_system_prompt(difficulty: Difficulty, context: Option<&ContextRef>) -> String {
    let mut prompt = format!("{}\n\n{}", BASE_SYSTEM_PROMPT, difficulty_instruction(difficulty));
    if let Some(ctx) = context {
        prompt.push_str(&format!(
            "\n\n## 현재 컨텍스트\n사용자가 보고 있는 콘텐츠: {} (id {})",
            ctx.kind.as_str(),
            ctx.id
        ));
    }
    prompt
}

/// 推理阶段：在系统提示词后附加工具清单与输出协议
pub fn build_planner_prompt(system: &str, tools_json: &str, call_schema: &str) -> String {
    format!(
        "{system}\n\n## 도구 사용 규칙\n\
         답변에 필요한 정보가 부족하면 아래 도구 중 하나를 호출하세요.\n\
         도구를 호출할 때는 다른 텍스트 없이 JSON 하나만 출력합니다: {{\"tool\": \"<이름>\", \"args\": {{...}}}}\n\
         도구가 더 필요 없으면 {{\"tool\": \"\", \"args\": {{}}}} 만 출력하세요. 최종 답변은 다음 단계에서 작성합니다.\n\
         절대로 특정 종목의 매수/매도를 권유하지 마세요.\n\n\
         ### Available tools\n{tools_json}\n\n### Tool call schema\n{call_schema}"
    )
}
